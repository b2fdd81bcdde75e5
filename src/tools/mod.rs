//! External tool adapters
//!
//! Every third-party program the pipeline runs is described by a typed
//! adapter that produces a `ToolInvocation`: program, arguments, per-child
//! environment, the files it is expected to write, and its resource asks.
//! - `masking`: BET, ROMEO phase quality, MakeHomogeneous
//! - `unwrap`: ROMEO, ROMEO B0, Laplacian
//! - `bgremove`: V-SHARP, PDF
//! - `inversion`: TGV-QSM, RTS, TV, NeXtQSM

pub mod bgremove;
pub mod inversion;
pub mod masking;
pub mod unwrap;

pub use bgremove::{pdf, vsharp};
pub use inversion::{nextqsm, rts, tgv, tv};
pub use masking::{bet, makehomogeneous, romeo_quality};
pub use unwrap::{laplacian, romeo, romeo_b0};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Execution;
use crate::error::{QsmError, Result};

/// Wall-clock limit for dipole inversion
pub const INVERSION_TIMEOUT: Duration = Duration::from_secs(3 * 3600);
/// Wall-clock limit for every other stage
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// The external programs the pipeline knows how to drive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    Bet,
    Romeo,
    Laplacian,
    Vsharp,
    Pdf,
    Tgv,
    Rts,
    Tv,
    Nextqsm,
    MakeHomogeneous,
}

impl Tool {
    pub const ALL: [Tool; 10] = [
        Tool::Bet,
        Tool::Romeo,
        Tool::Laplacian,
        Tool::Vsharp,
        Tool::Pdf,
        Tool::Tgv,
        Tool::Rts,
        Tool::Tv,
        Tool::Nextqsm,
        Tool::MakeHomogeneous,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tool::Bet => "bet",
            Tool::Romeo => "romeo",
            Tool::Laplacian => "laplacian",
            Tool::Vsharp => "vsharp",
            Tool::Pdf => "pdf",
            Tool::Tgv => "tgv",
            Tool::Rts => "rts",
            Tool::Tv => "tv",
            Tool::Nextqsm => "nextqsm",
            Tool::MakeHomogeneous => "makehomogeneous",
        }
    }

    /// Conventional executable name
    pub fn default_program(self) -> &'static str {
        match self {
            Tool::Bet => "bet",
            Tool::Romeo => "romeo",
            Tool::Laplacian => "laplacian_unwrapping",
            Tool::Vsharp => "vsharp",
            Tool::Pdf => "pdf",
            Tool::Tgv => "tgv_qsm",
            Tool::Rts => "rts",
            Tool::Tv => "tv",
            Tool::Nextqsm => "nextqsm",
            Tool::MakeHomogeneous => "makehomogeneous",
        }
    }

    pub fn from_name(name: &str) -> Option<Tool> {
        Tool::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Program overrides, read from a JSON object of tool name -> path
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPaths {
    overrides: BTreeMap<Tool, String>,
}

impl ToolPaths {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| QsmError::io(path, e))?;
        let raw: BTreeMap<String, String> = serde_json::from_str(&text).map_err(|e| QsmError::json(path, e))?;
        let mut overrides = BTreeMap::new();
        for (name, program) in raw {
            let tool = Tool::from_name(&name).ok_or_else(|| QsmError::UnknownOption(format!("tool '{}'", name)))?;
            overrides.insert(tool, program);
        }
        Ok(ToolPaths { overrides })
    }

    pub fn set(&mut self, tool: Tool, program: impl Into<String>) {
        self.overrides.insert(tool, program.into());
    }

    pub fn program(&self, tool: Tool) -> String {
        self.overrides
            .get(&tool)
            .cloned()
            .unwrap_or_else(|| tool.default_program().to_string())
    }
}

/// Per-node resource asks
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: usize,
    pub mem_gb: f64,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Resources {
    pub fn new(mem_gb: f64, timeout: Duration) -> Self {
        Resources { cpus: 1, mem_gb, timeout }
    }

    pub fn mem_mb(&self) -> u64 {
        (self.mem_gb * 1024.0).ceil() as u64
    }
}

impl Default for Resources {
    fn default() -> Self {
        Resources::new(1.0, DEFAULT_TIMEOUT)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// How an expected output file is located after the tool exits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OutputRule {
    /// The tool writes exactly this path
    Exact(PathBuf),
    /// The tool picks its own name; the single file in `dir` matching
    /// `pattern` is renamed to `rename_to`
    Discover {
        dir: PathBuf,
        pattern: String,
        rename_to: PathBuf,
    },
}

impl OutputRule {
    /// Final path of the output
    pub fn path(&self) -> &Path {
        match self {
            OutputRule::Exact(p) => p,
            OutputRule::Discover { rename_to, .. } => rename_to,
        }
    }
}

/// A fully specified external program run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: Tool,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Files copied into place before the run, (source, destination)
    pub staged: Vec<(PathBuf, PathBuf)>,
    pub outputs: Vec<OutputRule>,
    pub resources: Resources,
}

impl ToolInvocation {
    pub(crate) fn new(tool: Tool, paths: &ToolPaths, resources: Resources) -> Self {
        let threads = resources.cpus.to_string();
        ToolInvocation {
            tool,
            program: paths.program(tool),
            args: Vec::new(),
            env: vec![
                ("OMP_NUM_THREADS".to_string(), threads.clone()),
                ("ITK_GLOBAL_DEFAULT_NUMBER_OF_THREADS".to_string(), threads),
            ],
            staged: Vec::new(),
            outputs: Vec::new(),
            resources,
        }
    }

    pub(crate) fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub(crate) fn flag(self, name: &str, value: impl Into<String>) -> Self {
        self.arg(name).arg(value)
    }

    pub(crate) fn path_arg(self, p: &Path) -> Self {
        self.arg(p.to_string_lossy().into_owned())
    }

    pub(crate) fn output(mut self, rule: OutputRule) -> Self {
        self.outputs.push(rule);
        self
    }

    pub(crate) fn stage(mut self, from: &Path, to: &Path) -> Self {
        self.staged.push((from.to_path_buf(), to.to_path_buf()));
        self
    }

    /// The command line as one shell-quoted string
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Program and arguments for the given execution backend
    ///
    /// Batch backends submit a blocking job carrying the node's time,
    /// memory and CPU asks.
    pub fn for_execution(&self, execution: Execution, job_name: &str) -> (String, Vec<String>) {
        let secs = self.resources.timeout.as_secs();
        let walltime = format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60);
        let mem_gb = self.resources.mem_gb.ceil() as u64;
        match execution {
            Execution::Local => (self.program.clone(), self.args.clone()),
            Execution::Slurm => {
                let exports = std::iter::once("ALL".to_string())
                    .chain(self.env.iter().map(|(k, v)| format!("{}={}", k, v)))
                    .collect::<Vec<_>>()
                    .join(",");
                (
                    "sbatch".to_string(),
                    vec![
                        "--wait".to_string(),
                        format!("--job-name={}", job_name),
                        format!("--time={}", walltime),
                        format!("--mem={}G", mem_gb.max(1)),
                        format!("--cpus-per-task={}", self.resources.cpus),
                        format!("--export={}", exports),
                        format!("--wrap={}", self.command_line()),
                    ],
                )
            }
            Execution::Pbs => {
                let exports = self
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(",");
                let mut args = vec![
                    "-W".to_string(),
                    "block=true".to_string(),
                    "-N".to_string(),
                    job_name.to_string(),
                    "-l".to_string(),
                    format!(
                        "walltime={},mem={}gb,ncpus={}",
                        walltime,
                        mem_gb.max(1),
                        self.resources.cpus
                    ),
                    "-v".to_string(),
                    exports,
                    "--".to_string(),
                    self.program.clone(),
                ];
                args.extend(self.args.iter().cloned());
                ("qsub".to_string(), args)
            }
        }
    }
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ',' | '=' | ':' | '+'));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Copy staged inputs into place
pub fn stage_inputs(invocation: &ToolInvocation) -> Result<()> {
    for (from, to) in &invocation.staged {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QsmError::io(parent, e))?;
        }
        std::fs::copy(from, to).map_err(|e| QsmError::io(from, e))?;
    }
    Ok(())
}

/// Locate every expected output, renaming discovered files into place
///
/// Fails with `ToolFailure` when an output is missing or a discovery rule
/// matches nothing.
pub fn collect_outputs(invocation: &ToolInvocation) -> Result<Vec<PathBuf>> {
    let missing = |detail: String| QsmError::ToolFailure {
        tool: invocation.tool.to_string(),
        status: "exit 0".to_string(),
        detail,
    };

    let mut found = Vec::new();
    for rule in &invocation.outputs {
        match rule {
            OutputRule::Exact(path) => {
                if !path.is_file() {
                    return Err(missing(format!("expected output '{}' was not written", path.display())));
                }
                found.push(path.clone());
            }
            OutputRule::Discover { dir, pattern, rename_to } => {
                let re = Regex::new(pattern)
                    .map_err(|e| missing(format!("invalid output pattern '{}': {}", pattern, e)))?;
                let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
                    .map_err(|e| QsmError::io(dir, e))?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.path())
                    .filter(|p| p != rename_to)
                    .filter(|p| {
                        p.file_name()
                            .map(|n| re.is_match(&n.to_string_lossy()))
                            .unwrap_or(false)
                    })
                    .collect();
                matches.sort();
                match matches.pop() {
                    Some(latest) => {
                        std::fs::rename(&latest, rename_to).map_err(|e| QsmError::io(&latest, e))?;
                        found.push(rename_to.clone());
                    }
                    None if rename_to.is_file() => found.push(rename_to.clone()),
                    None => {
                        return Err(missing(format!(
                            "no output matching '{}' in '{}'",
                            pattern,
                            dir.display()
                        )))
                    }
                }
            }
        }
    }
    Ok(found)
}

pub(crate) fn fmt_float(v: f64) -> String {
    format!("{}", v)
}

pub(crate) fn fmt_triple(v: [f64; 3]) -> Vec<String> {
    v.iter().map(|x| fmt_float(*x)).collect()
}
