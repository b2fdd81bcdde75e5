//! Pipeline configuration: premades, option merging and per-run plans
//!
//! Options are layered: the built-in `default` premade, then the selected
//! premade (built-in or from a user premade file), then command-line
//! overrides. The merged `PlanOptions` is resolved per Run into an
//! immutable `RunPlan`, applying feasibility rules and downgrades.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QsmError, Result};
use crate::utils::threshold::ThresholdAlgorithm;

macro_rules! display_as_str {
    ($($ty:ty),* $(,)?) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QsmAlgorithm {
    Tgv,
    Rts,
    Tv,
    Nextqsm,
}

impl QsmAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            QsmAlgorithm::Tgv => "tgv",
            QsmAlgorithm::Rts => "rts",
            QsmAlgorithm::Tv => "tv",
            QsmAlgorithm::Nextqsm => "nextqsm",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum UnwrappingAlgorithm {
    #[serde(rename = "laplacian")]
    Laplacian,
    #[serde(rename = "romeo")]
    Romeo,
    #[serde(rename = "romeoB0")]
    #[value(name = "romeoB0")]
    RomeoB0,
}

impl UnwrappingAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            UnwrappingAlgorithm::Laplacian => "laplacian",
            UnwrappingAlgorithm::Romeo => "romeo",
            UnwrappingAlgorithm::RomeoB0 => "romeoB0",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BfAlgorithm {
    Vsharp,
    Pdf,
}

impl BfAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            BfAlgorithm::Vsharp => "vsharp",
            BfAlgorithm::Pdf => "pdf",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MaskingAlgorithm {
    Threshold,
    Bet,
    BetFirstecho,
}

impl MaskingAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            MaskingAlgorithm::Threshold => "threshold",
            MaskingAlgorithm::Bet => "bet",
            MaskingAlgorithm::BetFirstecho => "bet-firstecho",
        }
    }

    pub fn is_bet(self) -> bool {
        matches!(self, MaskingAlgorithm::Bet | MaskingAlgorithm::BetFirstecho)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MaskingInput {
    Magnitude,
    Phase,
}

impl MaskingInput {
    pub fn as_str(self) -> &'static str {
        match self {
            MaskingInput::Magnitude => "magnitude",
            MaskingInput::Phase => "phase",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FillingAlgorithm {
    /// Close enclosed background
    Morphological,
    /// Union with a BET mask of the first magnitude
    Bet,
    /// Morphological, then union with BET
    Both,
}

impl FillingAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            FillingAlgorithm::Morphological => "morphological",
            FillingAlgorithm::Bet => "bet",
            FillingAlgorithm::Both => "both",
        }
    }

    pub fn morphological(self) -> bool {
        matches!(self, FillingAlgorithm::Morphological | FillingAlgorithm::Both)
    }

    pub fn uses_bet(self) -> bool {
        matches!(self, FillingAlgorithm::Bet | FillingAlgorithm::Both)
    }
}

/// How `threshold_value` is interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    /// (0, 1] is a fraction of the 98th percentile, larger values are absolute
    Auto,
    /// Always relative to the 98th percentile; values above 1 are percentages
    Fraction,
    /// Always an absolute intensity
    Absolute,
}

impl ThresholdMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdMode::Auto => "auto",
            ThresholdMode::Fraction => "fraction",
            ThresholdMode::Absolute => "absolute",
        }
    }
}

/// Where external tool nodes execute
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    Local,
    Slurm,
    Pbs,
}

impl Execution {
    pub fn as_str(self) -> &'static str {
        match self {
            Execution::Local => "local",
            Execution::Slurm => "slurm",
            Execution::Pbs => "pbs",
        }
    }
}

display_as_str!(
    QsmAlgorithm,
    UnwrappingAlgorithm,
    BfAlgorithm,
    MaskingAlgorithm,
    MaskingInput,
    FillingAlgorithm,
    ThresholdMode,
    Execution,
);

/// A layer of pipeline options; `None` means "not set in this layer"
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOptions {
    pub description: Option<String>,
    pub qsm_algorithm: Option<QsmAlgorithm>,
    pub unwrapping_algorithm: Option<UnwrappingAlgorithm>,
    pub bf_algorithm: Option<BfAlgorithm>,
    pub masking_algorithm: Option<MaskingAlgorithm>,
    pub masking_input: Option<MaskingInput>,
    pub filling_algorithm: Option<FillingAlgorithm>,
    pub threshold_algorithm: Option<ThresholdAlgorithm>,
    pub threshold_algorithm_factor: Option<f64>,
    pub threshold_value: Option<f64>,
    pub threshold_mode: Option<ThresholdMode>,
    pub two_pass: Option<bool>,
    pub inhomogeneity_correction: Option<bool>,
    pub add_bet: Option<bool>,
    pub combine_phase: Option<bool>,
    pub use_existing_masks: Option<bool>,
    pub debug: Option<bool>,
    pub keep_intermediates: Option<bool>,
    pub bet_fractional_intensity: Option<f64>,
    pub tgv_iterations: Option<u32>,
    pub tgv_alphas: Option<[f64; 2]>,
    pub erosions: Option<usize>,
    pub fill_strength: Option<usize>,
    pub obliquity_threshold: Option<f64>,
    pub n_procs: Option<usize>,
    pub num_echoes: Option<usize>,
    pub execution: Option<Execution>,
    pub subjects: Option<Vec<String>>,
    pub sessions: Option<Vec<String>>,
}

impl PlanOptions {
    /// Every option name a premade may carry
    pub fn known_keys() -> Vec<String> {
        match serde_json::to_value(PlanOptions::default()) {
            Ok(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Parse one premade object, rejecting unknown keys
    pub fn from_json_value(value: Value, origin: &Path) -> Result<Self> {
        let Value::Object(map) = &value else {
            return Err(QsmError::Config(format!(
                "premade in '{}' must be a JSON object",
                origin.display()
            )));
        };
        let known = Self::known_keys();
        if let Some(key) = map.keys().find(|k| !known.contains(k)) {
            return Err(QsmError::UnknownOption(key.clone()));
        }
        serde_json::from_value(value).map_err(|e| QsmError::Config(format!("{}: {}", origin.display(), e)))
    }

    /// Overlay `over` on top of `self`: fields set in `over` win
    pub fn merge(&self, over: &PlanOptions) -> PlanOptions {
        let o = over.clone();
        let b = self.clone();
        PlanOptions {
            description: o.description.or(b.description),
            qsm_algorithm: o.qsm_algorithm.or(b.qsm_algorithm),
            unwrapping_algorithm: o.unwrapping_algorithm.or(b.unwrapping_algorithm),
            bf_algorithm: o.bf_algorithm.or(b.bf_algorithm),
            masking_algorithm: o.masking_algorithm.or(b.masking_algorithm),
            masking_input: o.masking_input.or(b.masking_input),
            filling_algorithm: o.filling_algorithm.or(b.filling_algorithm),
            threshold_algorithm: o.threshold_algorithm.or(b.threshold_algorithm),
            threshold_algorithm_factor: o.threshold_algorithm_factor.or(b.threshold_algorithm_factor),
            threshold_value: o.threshold_value.or(b.threshold_value),
            threshold_mode: o.threshold_mode.or(b.threshold_mode),
            two_pass: o.two_pass.or(b.two_pass),
            inhomogeneity_correction: o.inhomogeneity_correction.or(b.inhomogeneity_correction),
            add_bet: o.add_bet.or(b.add_bet),
            combine_phase: o.combine_phase.or(b.combine_phase),
            use_existing_masks: o.use_existing_masks.or(b.use_existing_masks),
            debug: o.debug.or(b.debug),
            keep_intermediates: o.keep_intermediates.or(b.keep_intermediates),
            bet_fractional_intensity: o.bet_fractional_intensity.or(b.bet_fractional_intensity),
            tgv_iterations: o.tgv_iterations.or(b.tgv_iterations),
            tgv_alphas: o.tgv_alphas.or(b.tgv_alphas),
            erosions: o.erosions.or(b.erosions),
            fill_strength: o.fill_strength.or(b.fill_strength),
            obliquity_threshold: o.obliquity_threshold.or(b.obliquity_threshold),
            n_procs: o.n_procs.or(b.n_procs),
            num_echoes: o.num_echoes.or(b.num_echoes),
            execution: o.execution.or(b.execution),
            subjects: o.subjects.or(b.subjects),
            sessions: o.sessions.or(b.sessions),
        }
    }

    /// JSON object with unset options removed, for display
    pub fn to_display_json(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
            Ok(other) => other,
            Err(_) => Value::Null,
        }
    }
}

/// Names of the built-in premades
pub const BUILTIN_PREMADES: [&str; 7] = ["default", "gre", "epi", "bet", "fast", "body", "nextqsm"];

/// Built-in premade by name
pub fn builtin_premade(name: &str) -> Option<PlanOptions> {
    let default = PlanOptions {
        description: Some("Default QSM reconstruction".to_string()),
        qsm_algorithm: Some(QsmAlgorithm::Rts),
        unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
        bf_algorithm: Some(BfAlgorithm::Pdf),
        masking_algorithm: Some(MaskingAlgorithm::Threshold),
        masking_input: Some(MaskingInput::Phase),
        filling_algorithm: Some(FillingAlgorithm::Both),
        threshold_algorithm: Some(ThresholdAlgorithm::Gaussian),
        threshold_mode: Some(ThresholdMode::Auto),
        two_pass: Some(true),
        inhomogeneity_correction: Some(false),
        add_bet: Some(false),
        combine_phase: Some(true),
        use_existing_masks: Some(false),
        debug: Some(false),
        keep_intermediates: Some(false),
        bet_fractional_intensity: Some(0.5),
        tgv_iterations: Some(1000),
        tgv_alphas: Some([0.0015, 0.0005]),
        erosions: Some(2),
        fill_strength: Some(0),
        obliquity_threshold: Some(crate::phase::DEFAULT_OBLIQUITY_THRESHOLD),
        execution: Some(Execution::Local),
        ..PlanOptions::default()
    };

    let premade = match name {
        "default" => default,
        "gre" => PlanOptions {
            description: Some("Suggested settings for 3D-GRE images".to_string()),
            qsm_algorithm: Some(QsmAlgorithm::Rts),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
            masking_input: Some(MaskingInput::Phase),
            two_pass: Some(true),
            ..PlanOptions::default()
        },
        "epi" => PlanOptions {
            description: Some("Suggested settings for 3D-EPI images".to_string()),
            masking_input: Some(MaskingInput::Magnitude),
            inhomogeneity_correction: Some(true),
            add_bet: Some(true),
            two_pass: Some(false),
            erosions: Some(3),
            ..PlanOptions::default()
        },
        "bet" => PlanOptions {
            description: Some("BET masking with a single reconstruction pass".to_string()),
            masking_algorithm: Some(MaskingAlgorithm::BetFirstecho),
            masking_input: Some(MaskingInput::Magnitude),
            two_pass: Some(false),
            erosions: Some(0),
            ..PlanOptions::default()
        },
        "fast" => PlanOptions {
            description: Some("Fast single-pass reconstruction".to_string()),
            qsm_algorithm: Some(QsmAlgorithm::Tgv),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
            bf_algorithm: Some(BfAlgorithm::Vsharp),
            masking_input: Some(MaskingInput::Magnitude),
            threshold_algorithm: Some(ThresholdAlgorithm::Otsu),
            filling_algorithm: Some(FillingAlgorithm::Morphological),
            two_pass: Some(false),
            combine_phase: Some(false),
            tgv_iterations: Some(100),
            ..PlanOptions::default()
        },
        "body" => PlanOptions {
            description: Some("Settings for body imaging".to_string()),
            qsm_algorithm: Some(QsmAlgorithm::Tv),
            masking_input: Some(MaskingInput::Magnitude),
            threshold_algorithm: Some(ThresholdAlgorithm::Gaussian),
            threshold_algorithm_factor: Some(1.5),
            filling_algorithm: Some(FillingAlgorithm::Morphological),
            fill_strength: Some(1),
            inhomogeneity_correction: Some(true),
            erosions: Some(3),
            ..PlanOptions::default()
        },
        "nextqsm" => PlanOptions {
            description: Some("NeXtQSM deep-learning dipole inversion".to_string()),
            qsm_algorithm: Some(QsmAlgorithm::Nextqsm),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Romeo),
            bf_algorithm: Some(BfAlgorithm::Vsharp),
            combine_phase: Some(false),
            ..PlanOptions::default()
        },
        _ => return None,
    };
    Some(premade)
}

/// Read a user premade file: a JSON object mapping premade name to options
pub fn load_premade_file(path: &Path) -> Result<BTreeMap<String, PlanOptions>> {
    let text = std::fs::read_to_string(path).map_err(|e| QsmError::io(path, e))?;
    let value: Value = serde_json::from_str(&text).map_err(|e| QsmError::json(path, e))?;
    let Value::Object(map) = value else {
        return Err(QsmError::Config(format!(
            "premade file '{}' must be a JSON object of premades",
            path.display()
        )));
    };
    map.into_iter()
        .map(|(name, options)| Ok((name, PlanOptions::from_json_value(options, path)?)))
        .collect()
}

/// Merge the option layers for `premade`
///
/// NeXtQSM defaults to `bet-firstecho` masking unless a layer above the
/// built-in `default` sets the masking algorithm.
pub fn resolve_options(
    premade: &str,
    user_premades: &BTreeMap<String, PlanOptions>,
    overrides: &PlanOptions,
) -> Result<PlanOptions> {
    let base = builtin_premade("default").unwrap_or_default();
    let builtin = builtin_premade(premade);
    let user = user_premades.get(premade);
    if builtin.is_none() && user.is_none() {
        return Err(QsmError::Config(format!("unknown premade '{}'", premade)));
    }

    let mut explicit = PlanOptions::default();
    if premade != "default" {
        if let Some(b) = &builtin {
            explicit = explicit.merge(b);
        }
    }
    if let Some(u) = user {
        explicit = explicit.merge(u);
    }
    explicit = explicit.merge(overrides);

    let mut merged = base.merge(&explicit);
    if merged.qsm_algorithm == Some(QsmAlgorithm::Nextqsm) && explicit.masking_algorithm.is_none() {
        merged.masking_algorithm = Some(MaskingAlgorithm::BetFirstecho);
    }
    Ok(merged)
}

/// What the planner knows about a Run when resolving its plan
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunFacts {
    pub has_magnitude: bool,
    pub has_existing_masks: bool,
}

/// Fully resolved reconstruction plan for one Run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    pub qsm_algorithm: QsmAlgorithm,
    pub unwrapping_algorithm: UnwrappingAlgorithm,
    pub bf_algorithm: BfAlgorithm,
    pub masking_algorithm: MaskingAlgorithm,
    pub masking_input: MaskingInput,
    pub filling_algorithm: FillingAlgorithm,
    pub threshold_algorithm: ThresholdAlgorithm,
    pub threshold_algorithm_factor: f64,
    pub threshold_value: Option<f64>,
    pub threshold_mode: ThresholdMode,
    pub combine_phase: bool,
    pub two_pass: bool,
    pub inhomogeneity_correction: bool,
    pub add_bet: bool,
    pub use_existing_masks: bool,
    pub erosions: usize,
    pub fill_strength: usize,
    pub tgv_alphas: [f64; 2],
    pub tgv_iterations: u32,
    pub bet_fractional_intensity: f64,
    pub obliquity_threshold: f64,
    pub debug: bool,
    pub keep_intermediates: bool,
    pub execution: Execution,
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| QsmError::Config(format!("option '{}' is not set", name)))
}

impl RunPlan {
    /// Validate merged options against the facts of one Run
    ///
    /// # Returns
    /// The plan plus the warnings for every downgrade applied
    pub fn resolve(options: &PlanOptions, facts: RunFacts) -> Result<(RunPlan, Vec<String>)> {
        let mut warnings = Vec::new();

        let threshold_algorithm = required(options.threshold_algorithm, "threshold_algorithm")?;
        let mut plan = RunPlan {
            qsm_algorithm: required(options.qsm_algorithm, "qsm_algorithm")?,
            unwrapping_algorithm: required(options.unwrapping_algorithm, "unwrapping_algorithm")?,
            bf_algorithm: required(options.bf_algorithm, "bf_algorithm")?,
            masking_algorithm: required(options.masking_algorithm, "masking_algorithm")?,
            masking_input: required(options.masking_input, "masking_input")?,
            filling_algorithm: required(options.filling_algorithm, "filling_algorithm")?,
            threshold_algorithm,
            threshold_algorithm_factor: options
                .threshold_algorithm_factor
                .unwrap_or_else(|| threshold_algorithm.default_factor()),
            threshold_value: options.threshold_value,
            threshold_mode: options.threshold_mode.unwrap_or(ThresholdMode::Auto),
            combine_phase: options.combine_phase.unwrap_or(false),
            two_pass: options.two_pass.unwrap_or(false),
            inhomogeneity_correction: options.inhomogeneity_correction.unwrap_or(false),
            add_bet: options.add_bet.unwrap_or(false),
            use_existing_masks: options.use_existing_masks.unwrap_or(false),
            erosions: options.erosions.unwrap_or(0),
            fill_strength: options.fill_strength.unwrap_or(0),
            tgv_alphas: required(options.tgv_alphas, "tgv_alphas")?,
            tgv_iterations: required(options.tgv_iterations, "tgv_iterations")?,
            bet_fractional_intensity: required(options.bet_fractional_intensity, "bet_fractional_intensity")?,
            obliquity_threshold: options
                .obliquity_threshold
                .unwrap_or(crate::phase::DEFAULT_OBLIQUITY_THRESHOLD),
            debug: options.debug.unwrap_or(false),
            keep_intermediates: options.keep_intermediates.unwrap_or(false),
            execution: options.execution.unwrap_or(Execution::Local),
        };
        plan.check_values()?;

        if plan.qsm_algorithm == QsmAlgorithm::Nextqsm && plan.unwrapping_algorithm == UnwrappingAlgorithm::RomeoB0 {
            return Err(QsmError::Config(
                "nextqsm requires unwrapping_algorithm 'romeo' or 'laplacian'".to_string(),
            ));
        }
        if plan.unwrapping_algorithm == UnwrappingAlgorithm::RomeoB0 {
            plan.combine_phase = true;
        }

        if !facts.has_magnitude {
            if plan.masking_algorithm.is_bet() {
                return Err(QsmError::Input(format!(
                    "masking_algorithm '{}' requires magnitude images",
                    plan.masking_algorithm
                )));
            }
            if plan.masking_input == MaskingInput::Magnitude {
                warnings.push("no magnitude images: masking_input downgraded to 'phase'".to_string());
                plan.masking_input = MaskingInput::Phase;
            }
            if plan.inhomogeneity_correction {
                warnings.push("no magnitude images: inhomogeneity correction disabled".to_string());
                plan.inhomogeneity_correction = false;
            }
            if plan.add_bet {
                warnings.push("no magnitude images: add_bet disabled".to_string());
                plan.add_bet = false;
            }
            if plan.filling_algorithm.uses_bet() {
                warnings.push("no magnitude images: filling_algorithm downgraded to 'morphological'".to_string());
                plan.filling_algorithm = FillingAlgorithm::Morphological;
            }
        }

        if plan.use_existing_masks && !facts.has_existing_masks {
            warnings.push("use_existing_masks is set but no masks were found; computing masks".to_string());
            plan.use_existing_masks = false;
        }

        if plan.masking_algorithm.is_bet() {
            plan.add_bet = false;
            plan.two_pass = false;
        }
        if plan.use_existing_masks {
            // tight and filled would be the same supplied mask
            plan.two_pass = false;
        }

        Ok((plan, warnings))
    }

    fn check_values(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.bet_fractional_intensity) {
            return Err(QsmError::Config(format!(
                "bet_fractional_intensity must be in [0, 1], got {}",
                self.bet_fractional_intensity
            )));
        }
        if self.tgv_alphas.iter().any(|&a| !(a > 0.0)) {
            return Err(QsmError::Config(format!(
                "tgv_alphas must be positive, got {:?}",
                self.tgv_alphas
            )));
        }
        if self.tgv_iterations == 0 {
            return Err(QsmError::Config("tgv_iterations must be positive".to_string()));
        }
        if let Some(v) = self.threshold_value {
            if !(v > 0.0) {
                return Err(QsmError::Config(format!("threshold_value must be positive, got {}", v)));
            }
        }
        if !(self.threshold_algorithm_factor > 0.0) {
            return Err(QsmError::Config(format!(
                "threshold_algorithm_factor must be positive, got {}",
                self.threshold_algorithm_factor
            )));
        }
        if !(self.obliquity_threshold >= 0.0) {
            return Err(QsmError::Config(format!(
                "obliquity_threshold must be nonnegative, got {}",
                self.obliquity_threshold
            )));
        }
        Ok(())
    }

    /// Whether tight and filled masks are reconstructed separately
    pub fn passes(&self) -> &'static [MaskPass] {
        if self.two_pass {
            &[MaskPass::Tight, MaskPass::Filled]
        } else {
            &[MaskPass::Filled]
        }
    }

    /// Whether the BET mask of the first magnitude augments the filled mask
    pub fn bet_augments_filling(&self) -> bool {
        self.masking_algorithm == MaskingAlgorithm::Threshold
            && (self.add_bet || self.filling_algorithm.uses_bet())
    }
}

/// Which member of a mask pair a reconstruction pass uses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskPass {
    Tight,
    Filled,
}

impl MaskPass {
    pub fn as_str(self) -> &'static str {
        match self {
            MaskPass::Tight => "tight",
            MaskPass::Filled => "filled",
        }
    }
}

display_as_str!(MaskPass);

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn with_magnitude() -> RunFacts {
        RunFacts { has_magnitude: true, has_existing_masks: false }
    }

    fn resolved(premade: &str, overrides: &PlanOptions) -> PlanOptions {
        resolve_options(premade, &BTreeMap::new(), overrides).unwrap()
    }

    #[test]
    fn test_every_builtin_resolves() {
        for name in BUILTIN_PREMADES {
            let options = resolved(name, &PlanOptions::default());
            let (plan, _) = RunPlan::resolve(&options, with_magnitude())
                .unwrap_or_else(|e| panic!("premade {} failed: {}", name, e));
            if plan.masking_algorithm.is_bet() {
                assert!(!plan.two_pass, "premade {}", name);
            }
        }
    }

    #[test]
    fn test_overrides_win() {
        let overrides = PlanOptions { qsm_algorithm: Some(QsmAlgorithm::Tv), erosions: Some(5), ..Default::default() };
        let options = resolved("fast", &overrides);
        assert_eq!(options.qsm_algorithm, Some(QsmAlgorithm::Tv));
        assert_eq!(options.erosions, Some(5));
        // from fast
        assert_eq!(options.threshold_algorithm, Some(ThresholdAlgorithm::Otsu));
        // from default
        assert_eq!(options.bet_fractional_intensity, Some(0.5));
    }

    #[test]
    fn test_unknown_premade() {
        let err = resolve_options("nope", &BTreeMap::new(), &PlanOptions::default()).unwrap_err();
        assert!(matches!(err, QsmError::Config(_)));
    }

    #[test]
    fn test_user_premade_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("premades.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"mine": {{"qsm_algorithm": "tv", "colour": "blue"}}}}"#).unwrap();
        let err = load_premade_file(&path).unwrap_err();
        match err {
            QsmError::UnknownOption(key) => assert_eq!(key, "colour"),
            other => panic!("expected UnknownOption, got {}", other),
        }
    }

    #[test]
    fn test_user_premade_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("premades.json");
        std::fs::write(&path, r#"{"mine": {"qsm_algorithm": "tv", "erosions": 1}, "fast": {"erosions": 4}}"#).unwrap();
        let user = load_premade_file(&path).unwrap();
        let mine = resolve_options("mine", &user, &PlanOptions::default()).unwrap();
        assert_eq!(mine.qsm_algorithm, Some(QsmAlgorithm::Tv));
        assert_eq!(mine.erosions, Some(1));
        let fast = resolve_options("fast", &user, &PlanOptions::default()).unwrap();
        assert_eq!(fast.erosions, Some(4));
        assert_eq!(fast.qsm_algorithm, Some(QsmAlgorithm::Tgv));
    }

    #[test]
    fn test_nextqsm_defaults_to_bet_firstecho() {
        let overrides = PlanOptions {
            qsm_algorithm: Some(QsmAlgorithm::Nextqsm),
            unwrapping_algorithm: Some(UnwrappingAlgorithm::Laplacian),
            ..Default::default()
        };
        let options = resolved("default", &overrides);
        assert_eq!(options.masking_algorithm, Some(MaskingAlgorithm::BetFirstecho));

        let explicit = PlanOptions { masking_algorithm: Some(MaskingAlgorithm::Threshold), ..overrides };
        let options = resolved("default", &explicit);
        assert_eq!(options.masking_algorithm, Some(MaskingAlgorithm::Threshold));
    }

    #[test]
    fn test_nextqsm_rejects_romeo_b0() {
        let overrides = PlanOptions { unwrapping_algorithm: Some(UnwrappingAlgorithm::RomeoB0), ..Default::default() };
        let options = resolved("nextqsm", &overrides);
        let err = RunPlan::resolve(&options, with_magnitude()).unwrap_err();
        assert!(matches!(err, QsmError::Config(_)));
    }

    #[test]
    fn test_romeo_b0_forces_combine() {
        let overrides = PlanOptions {
            unwrapping_algorithm: Some(UnwrappingAlgorithm::RomeoB0),
            combine_phase: Some(false),
            ..Default::default()
        };
        let (plan, _) = RunPlan::resolve(&resolved("default", &overrides), with_magnitude()).unwrap();
        assert!(plan.combine_phase);
    }

    #[test]
    fn test_bet_masking_disables_two_pass_and_add_bet() {
        let overrides = PlanOptions {
            masking_algorithm: Some(MaskingAlgorithm::Bet),
            two_pass: Some(true),
            add_bet: Some(true),
            ..Default::default()
        };
        let (plan, warnings) = RunPlan::resolve(&resolved("default", &overrides), with_magnitude()).unwrap();
        assert!(!plan.two_pass);
        assert!(!plan.add_bet);
        assert!(warnings.is_empty(), "silently disabled: {:?}", warnings);
        assert_eq!(plan.passes(), &[MaskPass::Filled]);
    }

    #[test]
    fn test_missing_magnitude_downgrades() {
        let overrides = PlanOptions { masking_input: Some(MaskingInput::Magnitude), ..Default::default() };
        let options = resolved("fast", &overrides);
        let (plan, warnings) = RunPlan::resolve(&options, RunFacts::default()).unwrap();
        assert_eq!(plan.masking_input, MaskingInput::Phase);
        assert!(warnings.iter().any(|w| w.contains("masking_input")), "{:?}", warnings);
    }

    #[test]
    fn test_bet_without_magnitude_is_input_error() {
        let options = resolved("bet", &PlanOptions::default());
        let err = RunPlan::resolve(&options, RunFacts::default()).unwrap_err();
        assert!(matches!(err, QsmError::Input(_)));
    }

    #[test]
    fn test_invalid_values() {
        let bad_fi = PlanOptions { bet_fractional_intensity: Some(1.5), ..Default::default() };
        assert!(RunPlan::resolve(&resolved("default", &bad_fi), with_magnitude()).is_err());
        let bad_alpha = PlanOptions { tgv_alphas: Some([0.0, 0.1]), ..Default::default() };
        assert!(RunPlan::resolve(&resolved("default", &bad_alpha), with_magnitude()).is_err());
    }

    #[test]
    fn test_threshold_factor_default_follows_algorithm() {
        let (plan, _) = RunPlan::resolve(&resolved("default", &PlanOptions::default()), with_magnitude()).unwrap();
        assert_eq!(plan.threshold_algorithm, ThresholdAlgorithm::Gaussian);
        assert_eq!(plan.threshold_algorithm_factor, 3.0);
        let (plan, _) = RunPlan::resolve(&resolved("fast", &PlanOptions::default()), with_magnitude()).unwrap();
        assert_eq!(plan.threshold_algorithm_factor, 1.0);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&UnwrappingAlgorithm::RomeoB0).unwrap(), "\"romeoB0\"");
        assert_eq!(serde_json::to_string(&MaskingAlgorithm::BetFirstecho).unwrap(), "\"bet-firstecho\"");
        assert!(PlanOptions::known_keys().contains(&"two_pass".to_string()));
    }
}
