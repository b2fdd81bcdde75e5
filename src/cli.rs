//! Command-line surface
//!
//! `qsm-pipeline run <BIDS_DIR> <OUTPUT_DIR>` plans, builds and executes the
//! reconstruction of every discovered Run; `qsm-pipeline list-premades`
//! prints the available premades.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{
    builtin_premade, load_premade_file, resolve_options, BfAlgorithm, Execution, FillingAlgorithm, MaskingAlgorithm,
    MaskingInput, PlanOptions, QsmAlgorithm, ThresholdMode, UnwrappingAlgorithm, BUILTIN_PREMADES,
};
use crate::discovery::RunKey;
use crate::error::{QsmError, Result};
use crate::graph::{build_graph, GraphContext};
use crate::planner::{plan_runs, system_memory_mb};
use crate::scheduler::{execute, RunOutcome, ScheduledRun, SchedulerConfig};
use crate::tools::ToolPaths;
use crate::utils::threshold::ThresholdAlgorithm;

pub const EXIT_OK: u8 = 0;
/// Configuration or discovery error
pub const EXIT_CONFIG: u8 = 1;
/// At least one Run failed
pub const EXIT_RUN_FAILED: u8 = 2;
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "qsm-pipeline", version, about = "QSM reconstruction for BIDS multi-echo GRE data")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Reconstruct susceptibility maps for every Run under BIDS_DIR
    Run(RunArgs),
    /// Print the built-in premades and those of a premade file
    ListPremades {
        #[arg(long, value_name = "FILE")]
        premades_file: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(value_name = "BIDS_DIR")]
    pub bids_dir: PathBuf,

    #[arg(value_name = "OUTPUT_DIR")]
    pub output_dir: PathBuf,

    #[arg(long, default_value = "default")]
    pub premade: String,

    /// JSON object of premade name -> options
    #[arg(long, value_name = "FILE")]
    pub premades_file: Option<PathBuf>,

    /// JSON object of tool name -> program path
    #[arg(long, value_name = "FILE")]
    pub tools_file: Option<PathBuf>,

    /// Working directory root, default `<OUTPUT_DIR>/work`
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Print each Run's graph without executing it
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, value_enum)]
    pub qsm_algorithm: Option<QsmAlgorithm>,
    #[arg(long, value_enum)]
    pub unwrapping_algorithm: Option<UnwrappingAlgorithm>,
    #[arg(long, value_enum)]
    pub bf_algorithm: Option<BfAlgorithm>,
    #[arg(long, value_enum)]
    pub masking_algorithm: Option<MaskingAlgorithm>,
    #[arg(long, value_enum)]
    pub masking_input: Option<MaskingInput>,
    #[arg(long, value_enum)]
    pub filling_algorithm: Option<FillingAlgorithm>,
    #[arg(long, value_enum)]
    pub threshold_algorithm: Option<ThresholdAlgorithm>,
    #[arg(long)]
    pub threshold_algorithm_factor: Option<f64>,
    /// Fraction of the robust maximum (<= 1) or absolute value
    #[arg(long)]
    pub threshold_value: Option<f64>,
    #[arg(long, value_enum)]
    pub threshold_mode: Option<ThresholdMode>,

    #[arg(long, value_name = "BOOL")]
    pub two_pass: Option<bool>,
    #[arg(long, value_name = "BOOL")]
    pub inhomogeneity_correction: Option<bool>,
    #[arg(long, value_name = "BOOL")]
    pub add_bet: Option<bool>,
    #[arg(long, value_name = "BOOL")]
    pub combine_phase: Option<bool>,
    #[arg(long)]
    pub use_existing_masks: bool,
    /// Debug logging; keeps working directories
    #[arg(long)]
    pub debug: bool,
    #[arg(long)]
    pub keep_intermediates: bool,

    #[arg(long)]
    pub bet_fractional_intensity: Option<f64>,
    #[arg(long)]
    pub tgv_iterations: Option<u32>,
    #[arg(long, num_args = 2, value_names = ["ALPHA1", "ALPHA0"])]
    pub tgv_alphas: Option<Vec<f64>>,
    #[arg(long)]
    pub erosions: Option<usize>,
    #[arg(long)]
    pub fill_strength: Option<usize>,
    /// Degrees
    #[arg(long)]
    pub obliquity_threshold: Option<f64>,
    #[arg(long)]
    pub n_procs: Option<usize>,
    #[arg(long)]
    pub num_echoes: Option<usize>,
    #[arg(long, value_enum)]
    pub execution: Option<Execution>,

    #[arg(long, value_delimiter = ',')]
    pub subjects: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub sessions: Vec<String>,
}

fn flag(set: bool) -> Option<bool> {
    set.then_some(true)
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
    (!v.is_empty()).then(|| v.to_vec())
}

impl RunArgs {
    /// Options given on the command line, the topmost layer
    pub fn overrides(&self) -> Result<PlanOptions> {
        let tgv_alphas = match self.tgv_alphas.as_deref() {
            None => None,
            Some([a1, a0]) => Some([*a1, *a0]),
            Some(other) => {
                return Err(QsmError::Config(format!("tgv_alphas needs two values, got {}", other.len())))
            }
        };
        Ok(PlanOptions {
            qsm_algorithm: self.qsm_algorithm,
            unwrapping_algorithm: self.unwrapping_algorithm,
            bf_algorithm: self.bf_algorithm,
            masking_algorithm: self.masking_algorithm,
            masking_input: self.masking_input,
            filling_algorithm: self.filling_algorithm,
            threshold_algorithm: self.threshold_algorithm,
            threshold_algorithm_factor: self.threshold_algorithm_factor,
            threshold_value: self.threshold_value,
            threshold_mode: self.threshold_mode,
            two_pass: self.two_pass,
            inhomogeneity_correction: self.inhomogeneity_correction,
            add_bet: self.add_bet,
            combine_phase: self.combine_phase,
            use_existing_masks: flag(self.use_existing_masks),
            debug: flag(self.debug),
            keep_intermediates: flag(self.keep_intermediates),
            bet_fractional_intensity: self.bet_fractional_intensity,
            tgv_iterations: self.tgv_iterations,
            tgv_alphas,
            erosions: self.erosions,
            fill_strength: self.fill_strength,
            obliquity_threshold: self.obliquity_threshold,
            n_procs: self.n_procs,
            num_echoes: self.num_echoes,
            execution: self.execution,
            subjects: non_empty(&self.subjects),
            sessions: non_empty(&self.sessions),
            ..PlanOptions::default()
        })
    }

    /// Merge built-in, file and command-line layers
    pub fn plan_options(&self) -> Result<PlanOptions> {
        let user = match &self.premades_file {
            Some(path) => load_premade_file(path)?,
            None => BTreeMap::new(),
        };
        resolve_options(&self.premade, &user, &self.overrides()?)
    }
}

/// Listing of built-in and user premades
pub fn list_premades(premades_file: Option<&Path>) -> Result<String> {
    let mut out = String::new();
    let mut entries: Vec<(String, PlanOptions, &str)> = BUILTIN_PREMADES
        .iter()
        .filter_map(|name| builtin_premade(name).map(|p| (name.to_string(), p, "built-in")))
        .collect();
    if let Some(path) = premades_file {
        entries.extend(load_premade_file(path)?.into_iter().map(|(n, p)| (n, p, "file")));
    }
    for (name, options, origin) in entries {
        let description = options.description.clone().unwrap_or_default();
        let _ = writeln!(out, "{} ({}): {}", name, origin, description);
        let json = serde_json::to_string_pretty(&options.to_display_json()).unwrap_or_default();
        for line in json.lines() {
            let _ = writeln!(out, "    {}", line);
        }
    }
    Ok(out)
}

/// What a `run` invocation did
#[derive(Debug)]
pub struct Report {
    pub outcomes: Vec<RunOutcome>,
    /// Runs that never reached execution
    pub rejected: Vec<(RunKey, QsmError)>,
}

impl Report {
    pub fn exit_code(&self, interrupted: bool) -> u8 {
        let cancelled = self
            .outcomes
            .iter()
            .any(|o| matches!(o.result, Err(QsmError::Cancelled)));
        if interrupted || cancelled {
            EXIT_INTERRUPTED
        } else if !self.rejected.is_empty() || self.outcomes.iter().any(|o| o.result.is_err()) {
            EXIT_RUN_FAILED
        } else {
            EXIT_OK
        }
    }
}

/// Plan, build and execute every Run
///
/// Errors returned here are fatal for the whole invocation; per-Run
/// failures end up in the report.
pub async fn run_pipeline(args: &RunArgs, options: &PlanOptions, cancel: CancellationToken) -> Result<Report> {
    let tools = match &args.tools_file {
        Some(path) => ToolPaths::load(path)?,
        None => ToolPaths::default(),
    };
    let planned = plan_runs(options, &args.bids_dir)?;
    let work_root = args.work_dir.clone().unwrap_or_else(|| args.output_dir.join("work"));
    let ctx = GraphContext { tools: &tools, output_dir: &args.output_dir, work_root: &work_root };

    let mut rejected = planned.rejected;
    let mut runs = Vec::with_capacity(planned.runs.len());
    for p in &planned.runs {
        match build_graph(p, &ctx) {
            Ok(graph) => runs.push(ScheduledRun { graph, keep_workdir: p.plan.debug || p.plan.keep_intermediates }),
            Err(e) => {
                warn!(run = %p.run.key, error = %e, "could not build reconstruction graph");
                rejected.push((p.run.key.clone(), e));
            }
        }
    }

    if args.dry_run {
        for run in &runs {
            println!("{}", run.graph);
        }
        return Ok(Report { outcomes: Vec::new(), rejected });
    }

    let execution = options.execution.unwrap_or(Execution::Local);
    let config = SchedulerConfig::new(planned.n_procs, system_memory_mb(), execution);
    info!(runs = runs.len(), n_procs = config.n_procs, execution = %execution, "executing");
    let outcomes = execute(runs, &config, cancel).await;
    Ok(Report { outcomes, rejected })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Run(run) => run,
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_overrides_from_flags() {
        let args = parse(&[
            "qsm-pipeline",
            "run",
            "bids",
            "out",
            "--premade",
            "fast",
            "--unwrapping-algorithm",
            "romeoB0",
            "--masking-algorithm",
            "bet-firstecho",
            "--two-pass",
            "false",
            "--tgv-alphas",
            "0.002",
            "0.001",
            "--subjects",
            "1,2",
            "--debug",
        ]);
        let o = args.overrides().unwrap();
        assert_eq!(o.unwrapping_algorithm, Some(UnwrappingAlgorithm::RomeoB0));
        assert_eq!(o.masking_algorithm, Some(MaskingAlgorithm::BetFirstecho));
        assert_eq!(o.two_pass, Some(false));
        assert_eq!(o.tgv_alphas, Some([0.002, 0.001]));
        assert_eq!(o.subjects, Some(vec!["1".to_string(), "2".to_string()]));
        assert_eq!(o.debug, Some(true));
        assert_eq!(o.use_existing_masks, None);
        assert_eq!(args.premade, "fast");
    }

    #[test]
    fn test_plan_options_layers() {
        let args = parse(&["qsm-pipeline", "run", "bids", "out", "--premade", "fast", "--tgv-iterations", "7"]);
        let options = args.plan_options().unwrap();
        assert_eq!(options.qsm_algorithm, Some(QsmAlgorithm::Tgv));
        assert_eq!(options.tgv_iterations, Some(7));
        // from the built-in default layer
        assert_eq!(options.bet_fractional_intensity, Some(0.5));
    }

    #[test]
    fn test_unknown_premade_is_config_error() {
        let args = parse(&["qsm-pipeline", "run", "bids", "out", "--premade", "nope"]);
        assert!(matches!(args.plan_options(), Err(QsmError::Config(_))));
    }

    #[test]
    fn test_list_premades_includes_builtins() {
        let text = list_premades(None).unwrap();
        for name in BUILTIN_PREMADES {
            assert!(text.contains(&format!("{} (built-in)", name)), "missing {}", name);
        }
    }

    #[test]
    fn test_exit_codes() {
        let key = RunKey {
            subject: "1".to_string(),
            session: None,
            acquisition: None,
            run: None,
            suffix: "MEGRE".to_string(),
        };
        let ok = Report {
            outcomes: vec![RunOutcome { key: key.clone(), result: Ok(PathBuf::from("x")), executed: 1, cached: 0 }],
            rejected: Vec::new(),
        };
        assert_eq!(ok.exit_code(false), EXIT_OK);
        assert_eq!(ok.exit_code(true), EXIT_INTERRUPTED);

        let failed = Report { outcomes: Vec::new(), rejected: vec![(key, QsmError::Input("bad".to_string()))] };
        assert_eq!(failed.exit_code(false), EXIT_RUN_FAILED);
    }
}
