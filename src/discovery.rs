//! Discovery of Runs in a BIDS-like input tree
//!
//! Walks `<root>/sub-*/[ses-*/]anat/` for magnitude/phase NIfTI files,
//! groups them into Runs by subject, session, acquisition, run and suffix,
//! and attaches echo metadata from the JSON sidecars.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{QsmError, Result};
use crate::sidecar::{read_sidecar, sidecar_path, EchoMetadata};

fn image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^sub-(?P<sub>[A-Za-z0-9]+)(?:_ses-(?P<ses>[A-Za-z0-9]+))?(?:_acq-(?P<acq>[A-Za-z0-9]+))?(?:_run-(?P<run>[A-Za-z0-9]+))?(?:_echo-(?P<echo>[0-9]+))?_part-(?P<part>mag|phase)_(?P<suffix>MEGRE|T2starw)\.nii(?:\.gz)?$",
        )
        .expect("valid image regex")
    })
}

fn mask_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^sub-(?P<sub>[A-Za-z0-9]+)(?:_ses-(?P<ses>[A-Za-z0-9]+))?(?:_acq-(?P<acq>[A-Za-z0-9]+))?(?:_run-(?P<run>[A-Za-z0-9]+))?(?:_echo-(?P<echo>[0-9]+))?(?:_[A-Za-z0-9]+-[A-Za-z0-9]+)*_mask\.nii(?:\.gz)?$",
        )
        .expect("valid mask regex")
    })
}

/// Identity of a Run; ordering gives the planner's stable Run order
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RunKey {
    pub subject: String,
    pub session: Option<String>,
    pub acquisition: Option<String>,
    pub run: Option<String>,
    /// `MEGRE` or `T2starw`
    pub suffix: String,
}

impl RunKey {
    /// BIDS entity prefix used for output names, e.g. `sub-1_ses-2_run-1`
    pub fn bids_prefix(&self) -> String {
        let mut s = format!("sub-{}", self.subject);
        if let Some(ses) = &self.session {
            s.push_str(&format!("_ses-{}", ses));
        }
        if let Some(acq) = &self.acquisition {
            s.push_str(&format!("_acq-{}", acq));
        }
        if let Some(run) = &self.run {
            s.push_str(&format!("_run-{}", run));
        }
        s
    }

    fn entities(&self) -> (&str, Option<&str>, Option<&str>, Option<&str>) {
        (
            &self.subject,
            self.session.as_deref(),
            self.acquisition.as_deref(),
            self.run.as_deref(),
        )
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.bids_prefix(), self.suffix)
    }
}

/// One magnitude/phase pair and its acquisition parameters
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Echo {
    /// BIDS echo entity, if present
    pub number: Option<u32>,
    pub echo_time: f64,
    pub field_strength: f64,
    pub b0_direction: [f64; 3],
    pub phase: PathBuf,
    pub magnitude: Option<PathBuf>,
    /// Sidecar of the phase image, propagated to the output
    pub sidecar: PathBuf,
    /// Pre-existing mask, when `use_existing_masks` found one
    pub mask: Option<PathBuf>,
}

/// An ordered, nonempty sequence of echoes of one acquisition
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Run {
    pub key: RunKey,
    pub echoes: Vec<Echo>,
}

impl Run {
    pub fn has_magnitude(&self) -> bool {
        self.echoes.iter().all(|e| e.magnitude.is_some())
    }

    pub fn has_masks(&self) -> bool {
        self.echoes.iter().all(|e| e.mask.is_some())
    }

    pub fn echo_times(&self) -> Vec<f64> {
        self.echoes.iter().map(|e| e.echo_time).collect()
    }
}

/// Discovery filters
#[derive(Clone, Debug, Default)]
pub struct DiscoveryOptions {
    /// Subject labels, with or without the `sub-` prefix
    pub subjects: Option<Vec<String>>,
    pub sessions: Option<Vec<String>>,
    pub use_existing_masks: bool,
}

/// Everything discovery found
#[derive(Debug, Default)]
pub struct Discovered {
    pub runs: Vec<Run>,
    /// Groups that exist but cannot be reconstructed
    pub invalid: Vec<(RunKey, QsmError)>,
    pub warnings: Vec<String>,
}

#[derive(Default)]
struct EchoFiles {
    magnitude: Option<PathBuf>,
    phase: Option<PathBuf>,
}

fn selected(label: &str, filter: &Option<Vec<String>>, prefix: &str) -> bool {
    match filter {
        None => true,
        Some(list) => list.iter().any(|s| s.strip_prefix(prefix).unwrap_or(s) == label),
    }
}

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.depth() > 0 && entry.file_type().is_dir() && (name.starts_with('.') || name == "derivatives")
}

/// Scan `root` for Runs
///
/// Fails with `Discovery` only when `root` is not a readable directory;
/// unusable groups are reported in `invalid` or `warnings`.
pub fn discover_runs(root: &Path, options: &DiscoveryOptions) -> Result<Discovered> {
    if !root.is_dir() {
        return Err(QsmError::Discovery(format!("'{}' is not a directory", root.display())));
    }

    let mut groups: BTreeMap<RunKey, BTreeMap<Option<u32>, EchoFiles>> = BTreeMap::new();
    let walker = WalkDir::new(root)
        .max_depth(4)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e));

    for entry in walker {
        let entry = entry.map_err(|e| QsmError::Discovery(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let in_anat = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|n| n == "anat");
        if !in_anat {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let Some(caps) = image_pattern().captures(&name) else {
            continue;
        };

        let key = RunKey {
            subject: caps["sub"].to_string(),
            session: caps.name("ses").map(|m| m.as_str().to_string()),
            acquisition: caps.name("acq").map(|m| m.as_str().to_string()),
            run: caps.name("run").map(|m| m.as_str().to_string()),
            suffix: caps["suffix"].to_string(),
        };
        if !selected(&key.subject, &options.subjects, "sub-") {
            continue;
        }
        if options.sessions.is_some() && !key.session.as_deref().is_some_and(|s| selected(s, &options.sessions, "ses-")) {
            continue;
        }

        let echo = caps.name("echo").and_then(|m| m.as_str().parse::<u32>().ok());
        let files = groups.entry(key).or_default().entry(echo).or_default();
        let path = entry.path().to_path_buf();
        match &caps["part"] {
            "mag" => files.magnitude = Some(path),
            _ => files.phase = Some(path),
        }
    }

    let masks = if options.use_existing_masks {
        discover_masks(root)
    } else {
        BTreeMap::new()
    };

    let mut discovered = Discovered::default();
    for (key, echoes) in groups {
        match build_run(&key, echoes, &masks, &mut discovered.warnings) {
            Ok(Some(run)) => discovered.runs.push(run),
            Ok(None) => {}
            Err(e) => discovered.invalid.push((key, e)),
        }
    }

    if discovered.runs.is_empty() && discovered.invalid.is_empty() {
        discovered
            .warnings
            .push(format!("no runs found under '{}'", root.display()));
    }
    for w in &discovered.warnings {
        warn!("{}", w);
    }
    Ok(discovered)
}

type MaskIndex = BTreeMap<(String, Option<String>, Option<String>, Option<String>), BTreeMap<Option<u32>, PathBuf>>;

/// Masks under `<root>/derivatives`, keyed by BIDS entities and echo
fn discover_masks(root: &Path) -> MaskIndex {
    let mut index = MaskIndex::new();
    let derivatives = root.join("derivatives");
    if !derivatives.is_dir() {
        return index;
    }
    for entry in WalkDir::new(&derivatives).sort_by_file_name().into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let Some(caps) = mask_pattern().captures(&name) else {
            continue;
        };
        let entities = (
            caps["sub"].to_string(),
            caps.name("ses").map(|m| m.as_str().to_string()),
            caps.name("acq").map(|m| m.as_str().to_string()),
            caps.name("run").map(|m| m.as_str().to_string()),
        );
        let echo = caps.name("echo").and_then(|m| m.as_str().parse::<u32>().ok());
        debug!(path = %entry.path().display(), "found existing mask");
        index.entry(entities).or_default().insert(echo, entry.path().to_path_buf());
    }
    index
}

fn build_run(
    key: &RunKey,
    files: BTreeMap<Option<u32>, EchoFiles>,
    masks: &MaskIndex,
    warnings: &mut Vec<String>,
) -> Result<Option<Run>> {
    if files.values().all(|f| f.phase.is_none()) {
        warnings.push(format!("{}: no phase images, skipping", key));
        return Ok(None);
    }

    let (sub, ses, acq, run) = key.entities();
    let run_masks = masks.get(&(
        sub.to_string(),
        ses.map(str::to_string),
        acq.map(str::to_string),
        run.map(str::to_string),
    ));

    let mut echoes = Vec::new();
    for (number, f) in files {
        let Some(phase) = f.phase else {
            warnings.push(format!("{}: echo {:?} has magnitude but no phase, ignoring it", key, number));
            continue;
        };
        let sidecar = sidecar_path(&phase);
        let meta = metadata_for(&sidecar, f.magnitude.as_deref())?;
        let mask = run_masks.and_then(|m| m.get(&number).or_else(|| m.get(&None)).cloned());
        echoes.push(Echo {
            number,
            echo_time: meta.echo_time,
            field_strength: meta.field_strength,
            b0_direction: meta.b0_direction,
            phase,
            magnitude: f.magnitude,
            sidecar,
            mask,
        });
    }

    if echoes.iter().any(|e| e.magnitude.is_some()) && echoes.iter().any(|e| e.magnitude.is_none()) {
        warnings.push(format!("{}: magnitude missing for some echoes, using phase only", key));
        for e in echoes.iter_mut() {
            e.magnitude = None;
        }
    }

    echoes.sort_by(|a, b| a.echo_time.total_cmp(&b.echo_time));
    Ok(Some(Run { key: key.clone(), echoes }))
}

/// Echo metadata from the phase sidecar, falling back to the magnitude's
fn metadata_for(phase_sidecar: &Path, magnitude: Option<&Path>) -> Result<EchoMetadata> {
    if phase_sidecar.is_file() {
        return read_sidecar(phase_sidecar)?.echo_metadata(phase_sidecar);
    }
    if let Some(mag) = magnitude {
        let mag_sidecar = sidecar_path(mag);
        if mag_sidecar.is_file() {
            return read_sidecar(&mag_sidecar)?.echo_metadata(&mag_sidecar);
        }
    }
    Err(QsmError::Input(format!("missing sidecar '{}'", phase_sidecar.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn touch(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn add_echo(anat: &Path, prefix: &str, echo: u32, te: f64, with_mag: bool) {
        let stem = format!("{}_echo-{}", prefix, echo);
        let json = format!(r#"{{"EchoTime": {}, "MagneticFieldStrength": 3.0}}"#, te);
        touch(&anat.join(format!("{}_part-phase_MEGRE.nii", stem)), "");
        touch(&anat.join(format!("{}_part-phase_MEGRE.json", stem)), &json);
        if with_mag {
            touch(&anat.join(format!("{}_part-mag_MEGRE.nii", stem)), "");
            touch(&anat.join(format!("{}_part-mag_MEGRE.json", stem)), &json);
        }
    }

    #[test]
    fn test_pattern_entities() {
        let caps = image_pattern()
            .captures("sub-01_ses-2_acq-fast_run-1_echo-3_part-phase_MEGRE.nii.gz")
            .unwrap();
        assert_eq!(&caps["sub"], "01");
        assert_eq!(&caps["ses"], "2");
        assert_eq!(&caps["acq"], "fast");
        assert_eq!(&caps["run"], "1");
        assert_eq!(&caps["echo"], "3");
        assert_eq!(&caps["part"], "phase");
        assert!(image_pattern().captures("sub-01_part-mag_T2starw.nii").is_some());
        assert!(image_pattern().captures("sub-01_part-mag_T1w.nii").is_none());
    }

    #[test]
    fn test_groups_and_orders_echoes() {
        let dir = tempfile::tempdir().unwrap();
        let anat = dir.path().join("sub-1/ses-1/anat");
        // written out of order: echo numbering does not define the order, TE does
        add_echo(&anat, "sub-1_ses-1", 2, 0.012, true);
        add_echo(&anat, "sub-1_ses-1", 1, 0.004, true);
        add_echo(&anat, "sub-1_ses-1", 3, 0.020, true);
        let found = discover_runs(dir.path(), &DiscoveryOptions::default()).unwrap();
        assert_eq!(found.runs.len(), 1);
        let run = &found.runs[0];
        assert_eq!(run.key.to_string(), "sub-1_ses-1_MEGRE");
        assert_eq!(run.echo_times(), vec![0.004, 0.012, 0.020]);
        assert!(run.has_magnitude());
    }

    #[test]
    fn test_stable_order_across_subjects() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["b", "a", "c"] {
            let anat = dir.path().join(format!("sub-{}/anat", sub));
            add_echo(&anat, &format!("sub-{}", sub), 1, 0.01, true);
        }
        let first = discover_runs(dir.path(), &DiscoveryOptions::default()).unwrap();
        let second = discover_runs(dir.path(), &DiscoveryOptions::default()).unwrap();
        let subjects: Vec<_> = first.runs.iter().map(|r| r.key.subject.clone()).collect();
        assert_eq!(subjects, vec!["a", "b", "c"]);
        assert_eq!(first.runs, second.runs);
    }

    #[test]
    fn test_phase_only_and_missing_phase() {
        let dir = tempfile::tempdir().unwrap();
        let anat = dir.path().join("sub-1/anat");
        add_echo(&anat, "sub-1", 1, 0.01, false);
        let anat2 = dir.path().join("sub-2/anat");
        touch(&anat2.join("sub-2_echo-1_part-mag_MEGRE.nii"), "");
        let found = discover_runs(dir.path(), &DiscoveryOptions::default()).unwrap();
        assert_eq!(found.runs.len(), 1);
        assert!(!found.runs[0].has_magnitude());
        assert!(found.warnings.iter().any(|w| w.contains("sub-2") && w.contains("no phase")));
    }

    #[test]
    fn test_missing_sidecar_is_invalid_run() {
        let dir = tempfile::tempdir().unwrap();
        let anat = dir.path().join("sub-1/anat");
        touch(&anat.join("sub-1_echo-1_part-phase_MEGRE.nii"), "");
        let found = discover_runs(dir.path(), &DiscoveryOptions::default()).unwrap();
        assert!(found.runs.is_empty());
        assert_eq!(found.invalid.len(), 1);
        assert_eq!(found.invalid[0].1.kind(), crate::error::FailureKind::InputError);
    }

    #[test]
    fn test_subject_and_session_filters() {
        let dir = tempfile::tempdir().unwrap();
        add_echo(&dir.path().join("sub-1/ses-a/anat"), "sub-1_ses-a", 1, 0.01, true);
        add_echo(&dir.path().join("sub-1/ses-b/anat"), "sub-1_ses-b", 1, 0.01, true);
        add_echo(&dir.path().join("sub-2/ses-a/anat"), "sub-2_ses-a", 1, 0.01, true);
        let options = DiscoveryOptions {
            subjects: Some(vec!["sub-1".to_string()]),
            sessions: Some(vec!["b".to_string()]),
            ..Default::default()
        };
        let found = discover_runs(dir.path(), &options).unwrap();
        assert_eq!(found.runs.len(), 1);
        assert_eq!(found.runs[0].key.session.as_deref(), Some("b"));
    }

    #[test]
    fn test_existing_masks_broadcast_and_per_echo() {
        let dir = tempfile::tempdir().unwrap();
        let anat = dir.path().join("sub-1/anat");
        add_echo(&anat, "sub-1", 1, 0.01, true);
        add_echo(&anat, "sub-1", 2, 0.02, true);
        let masks = dir.path().join("derivatives/masks/sub-1/anat");
        touch(&masks.join("sub-1_mask.nii"), "");
        touch(&masks.join("sub-1_echo-2_mask.nii"), "");
        let options = DiscoveryOptions { use_existing_masks: true, ..Default::default() };
        let found = discover_runs(dir.path(), &options).unwrap();
        let run = &found.runs[0];
        assert!(run.has_masks());
        assert!(run.echoes[0].mask.as_ref().unwrap().ends_with("sub-1_mask.nii"));
        assert!(run.echoes[1].mask.as_ref().unwrap().ends_with("sub-1_echo-2_mask.nii"));
    }

    #[test]
    fn test_not_a_directory() {
        let err = discover_runs(Path::new("/nonexistent/qsm/root"), &DiscoveryOptions::default()).unwrap_err();
        assert!(matches!(err, QsmError::Discovery(_)));
    }
}
