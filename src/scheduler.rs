//! Parallel execution of reconstruction graphs
//!
//! All Runs share one pool of CPU and memory permits. Within a Run a node
//! starts once its producers are done; the first non-optional failure
//! stops new launches for that Run while running nodes finish. Other Runs
//! are unaffected.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Execution;
use crate::discovery::RunKey;
use crate::error::{QsmError, Result};
use crate::graph::{Action, Node, RunGraph};
use crate::stages::InternalStage;
use crate::tools::{collect_outputs, stage_inputs, Resources, ToolInvocation};

/// Completion stamp written into a node directory, containing the node id
pub const DONE_STAMP: &str = ".done";

/// First launch plus one retry on transient failures
const MAX_ATTEMPTS: usize = 2;

/// Lines of tool output quoted in a `ToolFailure`
const OUTPUT_TAIL_LINES: usize = 20;

// Linux errno values of transient exec failures
const EAGAIN: i32 = 11;
const ETXTBSY: i32 = 26;

const SIGPIPE: i32 = 13;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Concurrent CPU slots
    pub n_procs: usize,
    /// Memory admitted at once, MB
    pub memory_mb: u64,
    pub execution: Execution,
}

impl SchedulerConfig {
    /// Without a known memory size, admit 6 GB per worker
    pub fn new(n_procs: usize, memory_mb: Option<u64>, execution: Execution) -> Self {
        let n_procs = n_procs.max(1);
        let memory_mb = memory_mb.unwrap_or(n_procs as u64 * 6 * 1024);
        SchedulerConfig { n_procs, memory_mb, execution }
    }
}

/// A graph to execute, with its retention policy
#[derive(Clone, Debug)]
pub struct ScheduledRun {
    pub graph: RunGraph,
    /// Keep the working directory after success
    pub keep_workdir: bool,
}

/// Result of one Run
#[derive(Debug)]
pub struct RunOutcome {
    pub key: RunKey,
    /// Path of the published susceptibility map
    pub result: Result<PathBuf>,
    pub executed: usize,
    pub cached: usize,
}

struct Pool {
    cpus: Arc<Semaphore>,
    memory: Arc<Semaphore>,
    cpu_capacity: u32,
    memory_capacity: u32,
    execution: Execution,
}

impl Pool {
    fn new(config: &SchedulerConfig) -> Self {
        let cpu_capacity = u32::try_from(config.n_procs).unwrap_or(u32::MAX).max(1);
        let memory_capacity = u32::try_from(config.memory_mb).unwrap_or(u32::MAX).max(1);
        Pool {
            cpus: Arc::new(Semaphore::new(cpu_capacity as usize)),
            memory: Arc::new(Semaphore::new(memory_capacity as usize)),
            cpu_capacity,
            memory_capacity,
            execution: config.execution,
        }
    }

    /// Asks larger than the pool are clamped so they can still run alone
    async fn acquire(&self, resources: Resources) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let cpus = u32::try_from(resources.cpus).unwrap_or(u32::MAX).clamp(1, self.cpu_capacity);
        let memory = u32::try_from(resources.mem_mb())
            .unwrap_or(u32::MAX)
            .clamp(1, self.memory_capacity);
        let cpu = self.cpus.clone().acquire_many_owned(cpus).await.map_err(|_| QsmError::Cancelled)?;
        let mem = self.memory.clone().acquire_many_owned(memory).await.map_err(|_| QsmError::Cancelled)?;
        Ok((cpu, mem))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Done,
    Failed,
    /// Never started because a required producer failed
    Skipped,
}

/// Execute every Run; outcomes are returned in Run order
pub async fn execute(runs: Vec<ScheduledRun>, config: &SchedulerConfig, cancel: CancellationToken) -> Vec<RunOutcome> {
    let pool = Arc::new(Pool::new(config));
    let mut set = JoinSet::new();
    for run in runs {
        set.spawn(execute_run(run, pool.clone(), cancel.child_token()));
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => error!(error = %e, "run task aborted"),
        }
    }
    outcomes.sort_by(|a, b| a.key.cmp(&b.key));
    outcomes
}

async fn execute_run(run: ScheduledRun, pool: Arc<Pool>, cancel: CancellationToken) -> RunOutcome {
    let graph = Arc::new(run.graph);
    let key = graph.key.clone();
    let deps = graph.dependencies();
    let n = graph.nodes.len();
    info!(run = %key, nodes = n, "starting run");

    let mut state = vec![NodeState::Pending; n];
    let mut tasks: JoinSet<(usize, Result<bool>)> = JoinSet::new();
    let mut failure: Option<QsmError> = None;
    let (mut executed, mut cached) = (0, 0);

    loop {
        if !cancel.is_cancelled() {
            for i in 0..n {
                if state[i] != NodeState::Pending {
                    continue;
                }
                let d = &deps[i];
                if d.required.iter().any(|&j| matches!(state[j], NodeState::Failed | NodeState::Skipped)) {
                    state[i] = NodeState::Skipped;
                    continue;
                }
                let ready = d.required.iter().all(|&j| state[j] == NodeState::Done)
                    && d.optional
                        .iter()
                        .all(|&j| matches!(state[j], NodeState::Done | NodeState::Failed | NodeState::Skipped));
                if ready {
                    state[i] = NodeState::Running;
                    let graph = graph.clone();
                    let pool = pool.clone();
                    let token = cancel.clone();
                    tasks.spawn(async move {
                        let result = run_node(&graph, i, &pool, &token).await;
                        (i, result)
                    });
                }
            }
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((i, Ok(was_cached))) => {
                state[i] = NodeState::Done;
                if was_cached {
                    cached += 1;
                } else {
                    executed += 1;
                }
            }
            Ok((i, Err(e))) => {
                state[i] = NodeState::Failed;
                let node = &graph.nodes[i];
                let e = masking_failure(node, e);
                if node.optional && !matches!(e, QsmError::Cancelled) {
                    warn!(run = %key, node = %node.label(), error = %e, "optional stage failed, continuing without it");
                } else {
                    if failure.is_none() {
                        if !matches!(e, QsmError::Cancelled) {
                            error!(run = %key, node = %node.label(), error = %e, "stage failed");
                        }
                        failure = Some(e);
                    }
                    cancel.cancel();
                }
            }
            Err(e) => {
                failure.get_or_insert(QsmError::ToolFailure {
                    tool: "scheduler".to_string(),
                    status: "panicked".to_string(),
                    detail: e.to_string(),
                });
                cancel.cancel();
            }
        }
    }

    let complete = state
        .iter()
        .zip(&graph.nodes)
        .all(|(s, node)| *s == NodeState::Done || (node.optional && *s == NodeState::Failed));
    let result = match failure {
        Some(e) => Err(e),
        None if complete => Ok(graph.chimap.clone()),
        None => Err(QsmError::Cancelled),
    };

    match &result {
        Ok(chimap) => {
            info!(run = %key, executed, cached, output = %chimap.display(), "run finished");
            if !run.keep_workdir {
                if let Err(e) = std::fs::remove_dir_all(&graph.workdir) {
                    warn!(run = %key, error = %e, "could not remove working directory");
                }
            }
        }
        Err(e) => {
            error!(run = %key, kind = %e.kind(), workdir = %graph.workdir.display(), "run failed");
        }
    }
    RunOutcome { key, result, executed, cached }
}

/// A failed tool that was the Run's only mask source fails masking
fn masking_failure(node: &Node, e: QsmError) -> QsmError {
    match e {
        QsmError::ToolFailure { tool, status, detail } if node.mask_source => {
            QsmError::MaskingFailed(format!("{} ({}, {}): {}", node.label(), tool, status, detail))
        }
        other => other,
    }
}

/// Remove declared outputs left by an unfinished attempt
fn clear_outputs(node: &Node) -> Result<()> {
    for output in &node.outputs {
        match std::fs::remove_file(output) {
            Ok(()) => debug!(path = %output.display(), "removed stale output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(QsmError::io(output, e)),
        }
    }
    Ok(())
}

/// A node is cached when its stamp matches its id and all outputs exist
pub fn is_cached(node: &Node) -> bool {
    match std::fs::read_to_string(node.dir.join(DONE_STAMP)) {
        Ok(stamp) => stamp.trim() == node.id && node.outputs.iter().all(|o| o.is_file()),
        Err(_) => false,
    }
}

/// Run one node; `Ok(true)` when it was already done
async fn run_node(graph: &RunGraph, i: usize, pool: &Pool, cancel: &CancellationToken) -> Result<bool> {
    let node = &graph.nodes[i];
    if is_cached(node) {
        debug!(run = %graph.key, node = %node.label(), "cached");
        return Ok(true);
    }

    let resources = node.resources();
    let _permits = tokio::select! {
        _ = cancel.cancelled() => return Err(QsmError::Cancelled),
        permits = pool.acquire(resources) => permits?,
    };
    if cancel.is_cancelled() {
        return Err(QsmError::Cancelled);
    }

    std::fs::create_dir_all(&node.dir).map_err(|e| QsmError::io(&node.dir, e))?;
    let stamp = node.dir.join(DONE_STAMP);
    if stamp.exists() {
        std::fs::remove_file(&stamp).map_err(|e| QsmError::io(&stamp, e))?;
    }
    clear_outputs(node)?;

    info!(run = %graph.key, node = %node.label(), "starting stage");
    let started = Instant::now();
    match &node.action {
        Action::Internal(stage) => run_internal(stage.clone(), node, resources.timeout).await?,
        Action::External(invocation) => run_external(invocation, node, &graph.key, pool.execution).await?,
    }
    std::fs::write(&stamp, &node.id).map_err(|e| QsmError::io(&stamp, e))?;
    info!(
        run = %graph.key,
        node = %node.label(),
        elapsed_s = started.elapsed().as_secs_f64(),
        "finished stage"
    );
    Ok(false)
}

async fn run_internal(stage: InternalStage, node: &Node, limit: Duration) -> Result<()> {
    let handle = tokio::task::spawn_blocking(move || stage.run());
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(QsmError::ToolFailure {
            tool: node.stage.to_string(),
            status: "panicked".to_string(),
            detail: e.to_string(),
        }),
        Err(_) => {
            // the blocking thread cannot be stopped; drop whatever it wrote so far
            warn!(node = %node.label(), "stage timed out, abandoning its worker thread");
            clear_outputs(node)?;
            Err(QsmError::TimedOut { stage: node.label(), limit })
        }
    }
}

fn is_transient_spawn_error(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(EAGAIN) | Some(ETXTBSY))
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn describe_status(status: &ExitStatus) -> String {
    match (status.code(), exit_signal(status)) {
        (Some(code), _) => format!("exit {}", code),
        (None, Some(sig)) => format!("signal {}", sig),
        (None, None) => "terminated".to_string(),
    }
}

fn output_tail(log: &Path) -> String {
    let text = std::fs::read_to_string(log).unwrap_or_default();
    let lines: Vec<&str> = text.lines().collect();
    let tail = lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n");
    if tail.trim().is_empty() {
        "no output".to_string()
    } else {
        tail
    }
}

async fn run_external(invocation: &ToolInvocation, node: &Node, key: &RunKey, execution: Execution) -> Result<()> {
    stage_inputs(invocation)?;
    let job_name = format!("{}_{}", key, node.label().replace(' ', "_"));
    let (program, args) = invocation.for_execution(execution, &job_name);
    let log_path = node.dir.join(format!("{}.log", invocation.tool));
    let limit = invocation.resources.timeout;
    let tool = invocation.tool.to_string();

    for attempt in 1..=MAX_ATTEMPTS {
        let stdout = std::fs::File::create(&log_path).map_err(|e| QsmError::io(&log_path, e))?;
        let stderr = stdout.try_clone().map_err(|e| QsmError::io(&log_path, e))?;
        debug!(command = %invocation.command_line(), attempt, "launching tool");

        let spawned = Command::new(&program)
            .args(&args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&node.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if attempt < MAX_ATTEMPTS && is_transient_spawn_error(&e) => {
                warn!(tool = %tool, error = %e, "transient launch failure, retrying");
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QsmError::ToolFailure {
                    tool,
                    status: "not found".to_string(),
                    detail: format!("program '{}' not found", program),
                })
            }
            Err(e) => return Err(QsmError::io(Path::new(&program), e)),
        };

        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(QsmError::io(Path::new(&program), e)),
            Err(_) => {
                let _ = child.kill().await;
                return Err(QsmError::TimedOut { stage: node.label(), limit });
            }
        };

        if status.success() {
            collect_outputs(invocation)?;
            return Ok(());
        }
        if attempt < MAX_ATTEMPTS && exit_signal(&status) == Some(SIGPIPE) {
            warn!(tool = %tool, "tool killed by SIGPIPE, retrying");
            continue;
        }
        return Err(QsmError::ToolFailure {
            tool,
            status: describe_status(&status),
            detail: output_tail(&log_path),
        });
    }

    Err(QsmError::ToolFailure {
        tool,
        status: "retries exhausted".to_string(),
        detail: output_tail(&log_path),
    })
}
