//! Run planning: discovery, validation and plan resolution
//!
//! `plan_runs` turns merged options and an input root into an ordered list
//! of (Run, RunPlan) pairs. Validation reads NIfTI headers only.

use std::path::Path;

use tracing::{info, warn};

use crate::config::{PlanOptions, RunFacts, RunPlan};
use crate::discovery::{discover_runs, DiscoveryOptions, Run, RunKey};
use crate::error::{QsmError, Result};
use crate::nifti_io::{read_header, VolumeHeader};
use crate::volume::{check_grid, VOXEL_SIZE_TOLERANCE};

/// Expected peak memory per concurrent reconstruction, GB
pub const MEMORY_PER_PROC_GB: f64 = 6.0;

/// A Run with its resolved plan
#[derive(Clone, Debug)]
pub struct PlannedRun {
    pub run: Run,
    pub plan: RunPlan,
    /// Downgrades applied while resolving the plan
    pub warnings: Vec<String>,
}

/// Output of `plan_runs`
#[derive(Debug)]
pub struct Planned {
    pub runs: Vec<PlannedRun>,
    /// Runs that cannot be reconstructed, with the reason
    pub rejected: Vec<(RunKey, QsmError)>,
    /// Worker pool size
    pub n_procs: usize,
}

/// Total system memory in MB, from `/proc/meminfo`
pub fn system_memory_mb() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = text.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// `min(floor(RAM_GB / 6), CPUs)`, at least 1
pub fn default_n_procs(memory_mb: Option<u64>, cpus: usize) -> usize {
    let by_memory = match memory_mb {
        Some(mb) => (mb as f64 / 1024.0 / MEMORY_PER_PROC_GB).floor() as usize,
        None => cpus,
    };
    by_memory.min(cpus).max(1)
}

/// Discover, validate and plan every Run under `root`
///
/// Configuration errors that do not depend on the input data fail the
/// whole call, as does finding nothing at all. Per-Run problems end up in
/// `rejected`.
pub fn plan_runs(options: &PlanOptions, root: &Path) -> Result<Planned> {
    // surface data-independent configuration errors before touching inputs
    RunPlan::resolve(options, RunFacts { has_magnitude: true, has_existing_masks: true })?;
    if options.num_echoes == Some(0) {
        return Err(QsmError::Config("num_echoes must be positive".to_string()));
    }

    let discovery = DiscoveryOptions {
        subjects: options.subjects.clone(),
        sessions: options.sessions.clone(),
        use_existing_masks: options.use_existing_masks.unwrap_or(false),
    };
    let found = discover_runs(root, &discovery)?;
    if found.runs.is_empty() && found.invalid.is_empty() {
        return Err(QsmError::Discovery(format!("no usable runs under '{}'", root.display())));
    }

    let mut planned = Planned {
        runs: Vec::new(),
        rejected: found.invalid,
        n_procs: options
            .n_procs
            .unwrap_or_else(|| default_n_procs(system_memory_mb(), cpu_count()))
            .max(1),
    };

    for mut run in found.runs {
        if let Some(n) = options.num_echoes {
            run.echoes.truncate(n);
        }
        let key = run.key.clone();
        match plan_one(run, options) {
            Ok(p) => {
                for w in &p.warnings {
                    warn!(run = %key, "{}", w);
                }
                info!(
                    run = %key,
                    echoes = p.run.echoes.len(),
                    qsm = %p.plan.qsm_algorithm,
                    masking = %p.plan.masking_algorithm,
                    two_pass = p.plan.two_pass,
                    "planned run"
                );
                planned.runs.push(p);
            }
            Err(e) => {
                warn!(run = %key, error = %e, "run rejected");
                planned.rejected.push((key, e));
            }
        }
    }

    planned.runs.sort_by(|a, b| a.run.key.cmp(&b.run.key));
    planned.rejected.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(planned)
}

fn plan_one(run: Run, options: &PlanOptions) -> Result<PlannedRun> {
    validate_run(&run)?;
    let facts = RunFacts {
        has_magnitude: run.has_magnitude(),
        has_existing_masks: run.has_masks(),
    };
    let (plan, warnings) = RunPlan::resolve(options, facts)?;
    Ok(PlannedRun { run, plan, warnings })
}

fn affines_close(a: &VolumeHeader, b: &VolumeHeader) -> bool {
    a.affine
        .iter()
        .zip(&b.affine)
        .all(|(x, y)| (x - y).abs() <= VOXEL_SIZE_TOLERANCE)
}

/// Check the Run invariants from headers and sidecars
///
/// All images share shape, voxel size and affine; all echoes share field
/// strength and B0 direction; echo times strictly increase.
pub fn validate_run(run: &Run) -> Result<()> {
    let first = run
        .echoes
        .first()
        .ok_or_else(|| QsmError::Input(format!("{}: run has no echoes", run.key)))?;
    let reference = read_header(&first.phase)?;

    for (e, echo) in run.echoes.iter().enumerate() {
        let images = std::iter::once(("phase", &echo.phase))
            .chain(echo.magnitude.iter().map(|m| ("magnitude", m)))
            .chain(echo.mask.iter().map(|m| ("mask", m)));
        for (what, path) in images {
            let header = read_header(path)?;
            let label = format!("{} echo {} {}", run.key, e + 1, what);
            check_grid(reference.dims, reference.voxel_size, header.dims, header.voxel_size, &label)?;
            if what != "mask" && !affines_close(&reference, &header) {
                return Err(QsmError::ShapeMismatch(format!("{}: affine differs from first echo", label)));
            }
        }

        if (echo.field_strength - first.field_strength).abs() > 1e-6 {
            return Err(QsmError::Input(format!(
                "{}: echo {} field strength {} T differs from {} T",
                run.key,
                e + 1,
                echo.field_strength,
                first.field_strength
            )));
        }
        let same_direction = echo
            .b0_direction
            .iter()
            .zip(&first.b0_direction)
            .all(|(a, b)| (a - b).abs() <= 1e-6);
        if !same_direction {
            return Err(QsmError::Input(format!("{}: echo {} B0 direction differs", run.key, e + 1)));
        }
    }

    for pair in run.echoes.windows(2) {
        if pair[1].echo_time <= pair[0].echo_time {
            return Err(QsmError::Input(format!(
                "{}: echo times must be strictly increasing ({} then {})",
                run.key, pair[0].echo_time, pair[1].echo_time
            )));
        }
    }
    Ok(())
}
