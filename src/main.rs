use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use qsm_pipeline::cli::{list_premades, run_pipeline, Cli, Command, RunArgs, EXIT_CONFIG, EXIT_OK};
use qsm_pipeline::config::PlanOptions;
use qsm_pipeline::logging;

fn load_options(args: &RunArgs) -> anyhow::Result<PlanOptions> {
    args.plan_options()
        .with_context(|| format!("resolving premade '{}'", args.premade))
}

async fn run(args: RunArgs) -> u8 {
    let options = match load_options(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return EXIT_CONFIG;
        }
    };
    let log = match logging::init(&args.output_dir, options.debug.unwrap_or(false)) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("error: {}", e);
            return EXIT_CONFIG;
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, waiting for running stages to finish");
                cancel.cancel();
            }
        }
    });

    let code = match run_pipeline(&args, &options, cancel.clone()).await {
        Ok(report) => {
            if !args.dry_run {
                println!(
                    "{}",
                    logging::summary(&report.outcomes, &report.rejected, &log.warnings.warnings())
                );
                println!("Log written to {}", log.log_path.display());
            }
            report.exit_code(cancel.is_cancelled())
        }
        Err(e) => {
            error!(kind = %e.kind(), "{}", e);
            EXIT_CONFIG
        }
    };
    drop(log);
    code
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::ListPremades { premades_file } => match list_premades(premades_file.as_deref()) {
            Ok(text) => {
                print!("{}", text);
                EXIT_OK
            }
            Err(e) => {
                eprintln!("error: {}", e);
                EXIT_CONFIG
            }
        },
        Command::Run(args) => run(args).await,
    };
    ExitCode::from(code)
}
