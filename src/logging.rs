//! Logging setup and end-of-execution summary
//!
//! Events go to stdout and, without ANSI codes, to
//! `<output>/log_<YYYYMMDD_HHMMSS>.txt`. Every WARN event is also kept by a
//! `WarningCollector` so the warnings can be repeated at the end.

use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tfmt, EnvFilter};

use crate::discovery::RunKey;
use crate::error::{QsmError, Result};
use crate::scheduler::RunOutcome;

/// Collects the message of every WARN event
#[derive(Clone, Debug, Default)]
pub struct WarningCollector {
    inner: Arc<Mutex<Vec<String>>>,
}

impl WarningCollector {
    pub fn warnings(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} ({})", self.message, self.fields.join(", "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for WarningCollector {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if let Ok(mut warnings) = self.inner.lock() {
            warnings.push(visitor.finish());
        }
    }
}

/// Keeps the file writer alive; drop it last to flush the log
pub struct LogGuard {
    _file: WorkerGuard,
    pub warnings: WarningCollector,
    pub log_path: PathBuf,
}

/// Install the global subscriber
///
/// The filter defaults to `info` (`debug` with `debug = true`) and is
/// overridden by `RUST_LOG`.
pub fn init(output_dir: &Path, debug: bool) -> Result<LogGuard> {
    std::fs::create_dir_all(output_dir).map_err(|e| QsmError::io(output_dir, e))?;
    let file_name = format!("log_{}.txt", chrono::Local::now().format("%Y%m%d_%H%M%S"));
    let log_path = output_dir.join(&file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(output_dir, &file_name));

    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let warnings = WarningCollector::default();

    tracing_subscriber::registry()
        .with(filter)
        .with(tfmt::layer().with_target(false))
        .with(tfmt::layer().with_target(false).with_ansi(false).with_writer(file_writer))
        .with(warnings.clone())
        .try_init()
        .map_err(|e| QsmError::Config(format!("logging setup failed: {}", e)))?;

    Ok(LogGuard { _file: guard, warnings, log_path })
}

/// Text of the end-of-execution summary
pub fn summary(outcomes: &[RunOutcome], rejected: &[(RunKey, QsmError)], warnings: &[String]) -> String {
    let mut out = String::new();
    if !warnings.is_empty() {
        let _ = writeln!(out, "Warnings ({}):", warnings.len());
        for w in warnings {
            let _ = writeln!(out, "  - {}", w);
        }
    }

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count() + rejected.len();
    let _ = writeln!(out, "Runs: {} succeeded, {} failed", outcomes.len() + rejected.len() - failed, failed);
    for outcome in outcomes {
        match &outcome.result {
            Ok(path) => {
                let _ = writeln!(out, "  [ok]     {} -> {}", outcome.key, path.display());
            }
            Err(e) => {
                let _ = writeln!(out, "  [failed] {} {}: {}", outcome.key, e.kind(), e);
            }
        }
    }
    for (key, e) in rejected {
        let _ = writeln!(out, "  [failed] {} {}: {}", key, e.kind(), e);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::warn;

    fn key(subject: &str) -> RunKey {
        RunKey {
            subject: subject.to_string(),
            session: None,
            acquisition: None,
            run: None,
            suffix: "MEGRE".to_string(),
        }
    }

    #[test]
    fn test_collector_keeps_warnings_only() {
        let collector = WarningCollector::default();
        let subscriber = tracing_subscriber::registry().with(collector.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("not collected");
            warn!(run = "sub-1", "masking_input downgraded");
        });
        assert_eq!(collector.warnings(), vec!["masking_input downgraded (run=sub-1)".to_string()]);
    }

    #[test]
    fn test_summary_lists_runs() {
        let outcomes = vec![
            RunOutcome {
                key: key("1"),
                result: Ok(PathBuf::from("/out/qsm/sub-1_Chimap.nii")),
                executed: 3,
                cached: 0,
            },
            RunOutcome {
                key: key("2"),
                result: Err(QsmError::MaskingFailed("empty".to_string())),
                executed: 1,
                cached: 0,
            },
        ];
        let rejected = vec![(key("3"), QsmError::Input("no phase".to_string()))];
        let text = summary(&outcomes, &rejected, &["w1".to_string()]);
        assert!(text.contains("Warnings (1):"));
        assert!(text.contains("Runs: 1 succeeded, 2 failed"));
        assert!(text.contains("sub-2_MEGRE MaskingFailed"));
        assert!(text.contains("sub-3_MEGRE InputError"));
    }
}
