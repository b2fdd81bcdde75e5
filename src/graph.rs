//! Reconstruction graph builder
//!
//! One `RunGraph` per Run: a list of nodes in topological order whose edges
//! are file paths. Every node owns one directory under the Run's working
//! directory, named after its stage and a stable hash of
//! `{plan, run, stage, echo, pass}`, so a rerun with the same plan finds the
//! finished nodes of the previous attempt.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::{BfAlgorithm, MaskPass, MaskingAlgorithm, MaskingInput, QsmAlgorithm, RunPlan, UnwrappingAlgorithm};
use crate::discovery::{Run, RunKey};
use crate::error::{QsmError, Result};
use crate::masking::{MaskingParams, ThresholdChoice};
use crate::nifti_io::read_header;
use crate::phase::{canonical_axial_affine, NormalizationScale, PSEUDO_PHASE_TE};
use crate::planner::PlannedRun;
use crate::stages::{InternalStage, MaskInputs};
use crate::tools::{self, Resources, ToolInvocation, ToolPaths, DEFAULT_TIMEOUT};
use crate::volume::{obliquity_norm, voxel_size_from_affine};

/// Memory ask of in-process stages, GB
const INTERNAL_MEMORY_GB: f64 = 1.0;

/// Characters of the node id used in directory names
const ID_PREFIX_LEN: usize = 12;

/// What a node does when it runs
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Internal(InternalStage),
    External(ToolInvocation),
}

#[derive(Clone, Debug)]
pub struct Node {
    /// sha256 hex of the node's identity
    pub id: String,
    pub stage: &'static str,
    /// Zero-based echo index for per-echo nodes
    pub echo: Option<usize>,
    pub pass: Option<MaskPass>,
    pub dir: PathBuf,
    pub inputs: Vec<PathBuf>,
    /// Inputs this node can do without if their producer fails
    pub optional_inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub action: Action,
    /// A failure of this node is logged and does not fail the Run
    pub optional: bool,
    /// Sole source of the Run's masks; its failure is a masking failure
    pub mask_source: bool,
}

impl Node {
    pub fn resources(&self) -> Resources {
        match &self.action {
            Action::External(inv) => inv.resources,
            Action::Internal(_) => Resources::new(INTERNAL_MEMORY_GB, DEFAULT_TIMEOUT),
        }
    }

    /// `stage`, `stage echo-2`, `stage echo-2 tight`
    pub fn label(&self) -> String {
        let mut s = self.stage.to_string();
        if let Some(e) = self.echo {
            s.push_str(&format!(" echo-{}", e + 1));
        }
        if let Some(p) = self.pass {
            s.push_str(&format!(" {}", p));
        }
        s
    }
}

/// Producers a node waits for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dependencies {
    pub required: Vec<usize>,
    pub optional: Vec<usize>,
}

/// The reconstruction DAG of one Run
#[derive(Clone, Debug)]
pub struct RunGraph {
    pub key: RunKey,
    pub workdir: PathBuf,
    /// Topologically ordered
    pub nodes: Vec<Node>,
    /// Published susceptibility map
    pub chimap: PathBuf,
}

impl RunGraph {
    /// For each node, the indices of the nodes producing its inputs
    ///
    /// Inputs with no producer are Run inputs and must already exist.
    pub fn dependencies(&self) -> Vec<Dependencies> {
        let producers: HashMap<&Path, usize> = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| n.outputs.iter().map(move |o| (o.as_path(), i)))
            .collect();
        let lookup = |paths: &[PathBuf]| {
            let mut deps: Vec<usize> = paths.iter().filter_map(|p| producers.get(p.as_path()).copied()).collect();
            deps.sort_unstable();
            deps.dedup();
            deps
        };
        self.nodes
            .iter()
            .map(|n| Dependencies {
                required: lookup(&n.inputs),
                optional: lookup(&n.optional_inputs),
            })
            .collect()
    }
}

impl fmt::Display for RunGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} nodes, workdir {})", self.key, self.nodes.len(), self.workdir.display())?;
        for node in &self.nodes {
            let kind = match &node.action {
                Action::Internal(_) => "internal".to_string(),
                Action::External(inv) => inv.tool.to_string(),
            };
            writeln!(
                f,
                "  {:<28} {:<12} {:<18}{}",
                node.label(),
                &node.id[..ID_PREFIX_LEN],
                kind,
                if node.optional { " (optional)" } else { "" }
            )?;
            for out in &node.outputs {
                writeln!(f, "      -> {}", out.display())?;
            }
        }
        Ok(())
    }
}

/// Stable node identity
pub fn node_id(plan_json: &str, key: &RunKey, stage: &str, echo: Option<usize>, pass: Option<MaskPass>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plan_json.as_bytes());
    hasher.update(b"\0");
    hasher.update(key.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(stage.as_bytes());
    hasher.update(b"\0");
    if let Some(e) = echo {
        hasher.update(e.to_string().as_bytes());
    }
    hasher.update(b"\0");
    if let Some(p) = pass {
        hasher.update(p.as_str().as_bytes());
    }
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Plan fields that do not change what any node computes
const NON_IDENTITY_FIELDS: [&str; 3] = ["debug", "keep_intermediates", "execution"];

/// Plan encoding hashed into node ids
fn identity_json(plan: &RunPlan) -> Result<String> {
    let mut value = serde_json::to_value(plan).map_err(|e| QsmError::Config(format!("plan encoding: {}", e)))?;
    if let serde_json::Value::Object(fields) = &mut value {
        for name in NON_IDENTITY_FIELDS {
            fields.remove(name);
        }
    }
    Ok(value.to_string())
}

/// `.nii` or `.nii.gz`, following the given file
fn nifti_ext(path: &Path) -> &'static str {
    if path.to_string_lossy().ends_with(".gz") {
        ".nii.gz"
    } else {
        ".nii"
    }
}

struct Builder<'a> {
    key: &'a RunKey,
    plan_json: String,
    workdir: PathBuf,
    nodes: Vec<Node>,
}

/// Directory and id reserved for a node before its action is built
struct Slot {
    stage: &'static str,
    echo: Option<usize>,
    pass: Option<MaskPass>,
    id: String,
    dir: PathBuf,
}

impl<'a> Builder<'a> {
    fn slot(&self, stage: &'static str, echo: Option<usize>, pass: Option<MaskPass>) -> Slot {
        let id = node_id(&self.plan_json, self.key, stage, echo, pass);
        let mut name = stage.to_string();
        if let Some(e) = echo {
            name.push_str(&format!("_echo-{}", e + 1));
        }
        if let Some(p) = pass {
            name.push_str(&format!("_{}", p));
        }
        name.push_str(&format!("-{}", &id[..ID_PREFIX_LEN]));
        let dir = self.workdir.join(name);
        Slot { stage, echo, pass, id, dir }
    }

    fn push(&mut self, slot: Slot, inputs: Vec<PathBuf>, outputs: Vec<PathBuf>, action: Action) {
        self.nodes.push(Node {
            id: slot.id,
            stage: slot.stage,
            echo: slot.echo,
            pass: slot.pass,
            dir: slot.dir,
            inputs,
            optional_inputs: Vec::new(),
            outputs,
            action,
            optional: false,
            mask_source: false,
        });
    }

    fn internal(&mut self, slot: Slot, inputs: Vec<PathBuf>, outputs: Vec<PathBuf>, stage: InternalStage) {
        self.push(slot, inputs, outputs, Action::Internal(stage));
    }

    /// Add a tool node; returns its declared outputs
    fn external(&mut self, slot: Slot, inputs: Vec<PathBuf>, invocation: ToolInvocation) -> Vec<PathBuf> {
        let outputs: Vec<PathBuf> = invocation.outputs.iter().map(|o| o.path().to_path_buf()).collect();
        self.push(slot, inputs, outputs.clone(), Action::External(invocation));
        outputs
    }

    fn first_output(outputs: Vec<PathBuf>) -> Result<PathBuf> {
        outputs
            .into_iter()
            .next()
            .ok_or_else(|| QsmError::Config("tool declares no outputs".to_string()))
    }
}

/// Field handed to dipole inversion
struct FieldInput {
    echo: Option<usize>,
    path: PathBuf,
    echo_time: f64,
    /// Echo whose masks apply
    mask_echo: usize,
}

/// Where the shared inputs of a graph live
pub struct GraphContext<'a> {
    pub tools: &'a ToolPaths,
    /// `<output>`; the map is published under `<output>/qsm/`
    pub output_dir: &'a Path,
    /// Parent of the per-Run working directories
    pub work_root: &'a Path,
}

/// Build the reconstruction DAG of one planned Run
///
/// Reads the first phase header to size the axial grid; everything else is
/// decided from the plan.
pub fn build_graph(planned: &PlannedRun, ctx: &GraphContext<'_>) -> Result<RunGraph> {
    let run: &Run = &planned.run;
    let plan: &RunPlan = &planned.plan;
    let first = run
        .echoes
        .first()
        .ok_or_else(|| QsmError::Input(format!("{}: run has no echoes", run.key)))?;
    let n_echoes = run.echoes.len();
    let has_magnitude = run.has_magnitude();
    let paths = ctx.tools;

    let plan_json = identity_json(plan)?;
    let mut b = Builder {
        key: &run.key,
        plan_json,
        workdir: ctx.work_root.join(run.key.to_string()),
        nodes: Vec::new(),
    };

    let header = read_header(&first.phase)?;
    let voxel_size = if obliquity_norm(&header.affine) >= plan.obliquity_threshold {
        let (affine, _) = canonical_axial_affine(&header.affine, header.dims);
        voxel_size_from_affine(&affine)
    } else {
        header.voxel_size
    };
    let voxel_size = [voxel_size.0, voxel_size.1, voxel_size.2];

    // phase scaling and axial resampling
    let mut phases = Vec::with_capacity(n_echoes);
    let mut magnitudes = Vec::with_capacity(n_echoes);
    let mut supplied_masks = Vec::with_capacity(n_echoes);
    for (e, echo) in run.echoes.iter().enumerate() {
        let slot = b.slot("scale_phase", Some(e), None);
        let scaled = slot.dir.join("phase_scaled.nii");
        b.internal(
            slot,
            vec![echo.phase.clone()],
            vec![scaled.clone()],
            InternalStage::ScalePhase { input: echo.phase.clone(), output: scaled.clone() },
        );

        let slot = b.slot("axial_resample", Some(e), None);
        let phase_out = slot.dir.join("phase.nii");
        let magnitude = echo.magnitude.clone().filter(|_| has_magnitude);
        let magnitude_out = magnitude.as_ref().map(|m| slot.dir.join(format!("magnitude{}", nifti_ext(m))));
        let mask = echo.mask.clone().filter(|_| plan.use_existing_masks);
        let mask_out = mask.as_ref().map(|m| slot.dir.join(format!("mask{}", nifti_ext(m))));

        let mut inputs = vec![scaled.clone()];
        inputs.extend(magnitude.iter().cloned());
        inputs.extend(mask.iter().cloned());
        let mut outputs = vec![phase_out.clone()];
        outputs.extend(magnitude_out.iter().cloned());
        outputs.extend(mask_out.iter().cloned());
        b.internal(
            slot,
            inputs,
            outputs,
            InternalStage::AxialResample {
                phase: scaled,
                magnitude,
                mask,
                obliquity_threshold: plan.obliquity_threshold,
                phase_out: phase_out.clone(),
                magnitude_out: magnitude_out.clone(),
                mask_out: mask_out.clone(),
            },
        );
        phases.push(phase_out);
        magnitudes.push(magnitude_out);
        supplied_masks.push(mask_out);
    }
    let magnitudes: Option<Vec<PathBuf>> = magnitudes.into_iter().collect();

    // magnitude used for masking, optionally bias corrected
    let masking_magnitudes: Option<Vec<PathBuf>> = match &magnitudes {
        Some(mags) if plan.inhomogeneity_correction => {
            let mut corrected = Vec::with_capacity(n_echoes);
            for (e, mag) in mags.iter().enumerate() {
                let slot = b.slot("inhomogeneity_correct", Some(e), None);
                let inv = tools::makehomogeneous(mag, &slot.dir, paths);
                corrected.push(Builder::first_output(b.external(slot, vec![mag.clone()], inv))?);
            }
            Some(corrected)
        }
        other => other.clone(),
    };
    let require_magnitude = || {
        masking_magnitudes
            .clone()
            .ok_or_else(|| QsmError::Input(format!("{}: masking needs magnitude images", run.key)))
    };

    // masks
    let mut bet_augment = None;
    let mask_inputs = if plan.use_existing_masks {
        let masks: Option<Vec<PathBuf>> = supplied_masks.into_iter().collect();
        MaskInputs::Existing(masks.ok_or_else(|| QsmError::Input(format!("{}: missing existing masks", run.key)))?)
    } else if plan.masking_algorithm.is_bet() {
        let mags = require_magnitude()?;
        let bet_echoes = if plan.masking_algorithm == MaskingAlgorithm::BetFirstecho { 1 } else { n_echoes };
        let mut masks = Vec::with_capacity(bet_echoes);
        for (e, mag) in mags.iter().take(bet_echoes).enumerate() {
            let slot = b.slot("bet", Some(e), None);
            let inv = tools::bet(mag, &slot.dir, plan.bet_fractional_intensity, paths);
            masks.push(Builder::first_output(b.external(slot, vec![mag.clone()], inv))?);
            if let Some(node) = b.nodes.last_mut() {
                node.mask_source = true;
            }
        }
        MaskInputs::Bet(masks)
    } else {
        let weights = match plan.masking_input {
            MaskingInput::Magnitude => require_magnitude()?,
            MaskingInput::Phase => {
                let mut quality = Vec::with_capacity(n_echoes);
                for (e, phase) in phases.iter().enumerate() {
                    let slot = b.slot("phase_quality", Some(e), None);
                    let mag = magnitudes.as_ref().map(|m| m[e].clone());
                    let inv = tools::romeo_quality(phase, mag.as_deref(), run.echoes[e].echo_time, &slot.dir, paths);
                    let mut inputs = vec![phase.clone()];
                    inputs.extend(mag);
                    quality.push(Builder::first_output(b.external(slot, inputs, inv))?);
                }
                quality
            }
        };
        if plan.bet_augments_filling() {
            if let Some(mags) = &masking_magnitudes {
                let slot = b.slot("bet_augment", None, None);
                let inv = tools::bet(&mags[0], &slot.dir, plan.bet_fractional_intensity, paths);
                let out = Builder::first_output(b.external(slot, vec![mags[0].clone()], inv))?;
                if let Some(node) = b.nodes.last_mut() {
                    node.optional = true;
                }
                bet_augment = Some(out);
            }
        }
        MaskInputs::Threshold { weights, bet: bet_augment.clone() }
    };

    let slot = b.slot("masks", None, None);
    let tight: Vec<PathBuf> = (0..n_echoes)
        .map(|e| slot.dir.join(format!("mask_echo-{}_tight.nii", e + 1)))
        .collect();
    let filled: Vec<PathBuf> = (0..n_echoes)
        .map(|e| slot.dir.join(format!("mask_echo-{}_filled.nii", e + 1)))
        .collect();
    let mask_sources = match &mask_inputs {
        MaskInputs::Existing(p) | MaskInputs::Bet(p) => p.clone(),
        MaskInputs::Threshold { weights, .. } => weights.clone(),
    };
    let params = MaskingParams {
        threshold: ThresholdChoice::from_options(
            plan.threshold_value,
            plan.threshold_mode,
            plan.threshold_algorithm,
            plan.threshold_algorithm_factor,
        ),
        filling: plan.filling_algorithm,
        fill_strength: plan.fill_strength,
        erosions: plan.erosions,
    };
    b.internal(
        slot,
        mask_sources,
        tight.iter().chain(&filled).cloned().collect(),
        InternalStage::ComputeMasks {
            inputs: mask_inputs,
            n_echoes,
            params,
            tight_out: tight.clone(),
            filled_out: filled.clone(),
        },
    );
    if let (Some(bet), Some(node)) = (bet_augment, b.nodes.last_mut()) {
        node.optional_inputs.push(bet);
    }

    // unwrapping and field normalization
    let is_tgv = plan.qsm_algorithm == QsmAlgorithm::Tgv;
    let scale = if plan.qsm_algorithm == QsmAlgorithm::Nextqsm {
        NormalizationScale::PpmTwoPi
    } else {
        NormalizationScale::Ppm
    };
    let field_strength = first.field_strength;
    let b0_direction = first.b0_direction;
    let echo_times = run.echo_times();

    let fields: Vec<FieldInput> = if is_tgv && !plan.combine_phase {
        phases
            .iter()
            .enumerate()
            .map(|(e, p)| FieldInput { echo: Some(e), path: p.clone(), echo_time: echo_times[e], mask_echo: e })
            .collect()
    } else {
        let frequency_hz = if plan.combine_phase {
            Some(if plan.unwrapping_algorithm == UnwrappingAlgorithm::RomeoB0 {
                let slot = b.slot("unwrap", None, None);
                let inv = tools::romeo_b0(&phases, magnitudes.as_deref(), &echo_times, &slot.dir, paths);
                let mut inputs = phases.clone();
                inputs.extend(magnitudes.iter().flatten().cloned());
                Builder::first_output(b.external(slot, inputs, inv))?
            } else {
                let unwrapped = unwrap_echoes(&mut b, plan, &phases, magnitudes.as_deref(), &echo_times, paths)?;
                let slot = b.slot("combine_echoes", None, None);
                let frequency_out = slot.dir.join("frequency.nii");
                let phase_out = slot.dir.join("phase_combined.nii");
                let mut inputs = unwrapped.clone();
                inputs.extend(magnitudes.iter().flatten().cloned());
                b.internal(
                    slot,
                    inputs,
                    vec![frequency_out.clone(), phase_out.clone()],
                    InternalStage::CombineEchoes {
                        phases: unwrapped,
                        magnitudes: magnitudes.clone(),
                        echo_times: echo_times.clone(),
                        frequency_out: frequency_out.clone(),
                        phase_out,
                    },
                );
                frequency_out
            })
        } else {
            None
        };

        match frequency_hz {
            Some(freq) if is_tgv => {
                let slot = b.slot("pseudo_phase", None, None);
                let output = slot.dir.join("phase.nii");
                b.internal(
                    slot,
                    vec![freq.clone()],
                    vec![output.clone()],
                    InternalStage::FreqToPhase { frequency: freq, echo_time: PSEUDO_PHASE_TE, wraps: true, output: output.clone() },
                );
                vec![FieldInput { echo: None, path: output, echo_time: PSEUDO_PHASE_TE, mask_echo: 0 }]
            }
            Some(freq) => {
                let slot = b.slot("normalize", None, None);
                let output = slot.dir.join("field.nii");
                b.internal(
                    slot,
                    vec![freq.clone()],
                    vec![output.clone()],
                    InternalStage::FreqToNormalized {
                        frequency: freq,
                        field_strength,
                        scale_factor: scale.frequency_factor(),
                        output: output.clone(),
                    },
                );
                vec![FieldInput { echo: None, path: output, echo_time: echo_times[0], mask_echo: 0 }]
            }
            None => {
                let unwrapped = unwrap_echoes(&mut b, plan, &phases, magnitudes.as_deref(), &echo_times, paths)?;
                let mut fields = Vec::with_capacity(n_echoes);
                for (e, phase) in unwrapped.into_iter().enumerate() {
                    let slot = b.slot("normalize", Some(e), None);
                    let output = slot.dir.join("field.nii");
                    b.internal(
                        slot,
                        vec![phase.clone()],
                        vec![output.clone()],
                        InternalStage::PhaseToNormalized {
                            phase,
                            echo_time: echo_times[e],
                            field_strength,
                            scale_factor: scale.phase_factor(),
                            output: output.clone(),
                        },
                    );
                    fields.push(FieldInput { echo: Some(e), path: output, echo_time: echo_times[e], mask_echo: e });
                }
                fields
            }
        }
    };

    // background removal, inversion and two-pass fusion
    let mut per_field = Vec::with_capacity(fields.len());
    for field in &fields {
        let mut chis = Vec::with_capacity(2);
        for &pass in plan.passes() {
            let mask = match pass {
                MaskPass::Tight => &tight[field.mask_echo],
                MaskPass::Filled => &filled[field.mask_echo],
            };
            let chi = if is_tgv {
                let slot = b.slot("qsm", field.echo, Some(pass));
                let inv = tools::tgv(
                    &field.path,
                    mask,
                    field.echo_time,
                    field_strength,
                    plan.tgv_alphas,
                    plan.tgv_iterations,
                    &slot.dir,
                    paths,
                );
                Builder::first_output(b.external(slot, vec![field.path.clone(), mask.clone()], inv))?
            } else {
                let slot = b.slot("bgremove", field.echo, Some(pass));
                let inv = match plan.bf_algorithm {
                    BfAlgorithm::Vsharp => tools::vsharp(&field.path, mask, voxel_size, &slot.dir, paths),
                    BfAlgorithm::Pdf => tools::pdf(&field.path, mask, voxel_size, b0_direction, &slot.dir, paths),
                };
                let outs = b.external(slot, vec![field.path.clone(), mask.clone()], inv);
                let tissue = outs
                    .first()
                    .cloned()
                    .ok_or_else(|| QsmError::Config("background removal declares no outputs".to_string()))?;
                let inversion_mask = outs.get(1).cloned().unwrap_or_else(|| mask.clone());

                let slot = b.slot("qsm", field.echo, Some(pass));
                let inv = match plan.qsm_algorithm {
                    QsmAlgorithm::Tv => tools::tv(&tissue, &inversion_mask, voxel_size, b0_direction, &slot.dir, paths),
                    QsmAlgorithm::Nextqsm => {
                        tools::nextqsm(&tissue, &inversion_mask, voxel_size, b0_direction, &slot.dir, paths)
                    }
                    _ => tools::rts(&tissue, &inversion_mask, voxel_size, b0_direction, &slot.dir, paths),
                };
                Builder::first_output(b.external(slot, vec![tissue, inversion_mask], inv))?
            };
            chis.push(chi);
        }

        let result = if let [tight_chi, filled_chi] = chis.as_slice() {
            let slot = b.slot("two_pass", field.echo, None);
            let output = slot.dir.join("chi_fused.nii");
            b.internal(
                slot,
                vec![tight_chi.clone(), filled_chi.clone()],
                vec![output.clone()],
                InternalStage::FuseTwoPass { tight: tight_chi.clone(), filled: filled_chi.clone(), output: output.clone() },
            );
            output
        } else {
            chis.into_iter()
                .next()
                .ok_or_else(|| QsmError::Config("plan has no reconstruction passes".to_string()))?
        };
        per_field.push(result);
    }

    // average, back to the input grid, publish
    let slot = b.slot("average", None, None);
    let averaged = slot.dir.join("chi_average.nii");
    b.internal(
        slot,
        per_field.clone(),
        vec![averaged.clone()],
        InternalStage::NonzeroAverage { inputs: per_field, output: averaged.clone() },
    );

    let reference = first
        .magnitude
        .clone()
        .filter(|_| has_magnitude)
        .unwrap_or_else(|| first.phase.clone());
    let slot = b.slot("resample", None, None);
    let resampled = slot.dir.join("chi.nii");
    b.internal(
        slot,
        vec![averaged.clone(), reference.clone()],
        vec![resampled.clone()],
        InternalStage::ResampleLike { source: averaged, reference, output: resampled.clone() },
    );

    let qsm_dir = ctx.output_dir.join("qsm");
    let prefix = run.key.bids_prefix();
    let chimap = qsm_dir.join(format!("{}_Chimap.nii", prefix));
    let json_out = qsm_dir.join(format!("{}_Chimap.json", prefix));
    let slot = b.slot("publish", None, None);
    b.internal(
        slot,
        vec![resampled.clone()],
        vec![chimap.clone(), json_out.clone()],
        InternalStage::Publish { chi: resampled, sidecar: first.sidecar.clone(), nifti_out: chimap.clone(), json_out },
    );

    Ok(RunGraph { key: run.key.clone(), workdir: b.workdir, nodes: b.nodes, chimap })
}

/// Per-echo unwrapping nodes; returns the unwrapped phase of each echo
fn unwrap_echoes(
    b: &mut Builder<'_>,
    plan: &RunPlan,
    phases: &[PathBuf],
    magnitudes: Option<&[PathBuf]>,
    echo_times: &[f64],
    paths: &ToolPaths,
) -> Result<Vec<PathBuf>> {
    let mut unwrapped = Vec::with_capacity(phases.len());
    for (e, phase) in phases.iter().enumerate() {
        let slot = b.slot("unwrap", Some(e), None);
        let mag = magnitudes.map(|m| m[e].clone());
        let inv = match plan.unwrapping_algorithm {
            UnwrappingAlgorithm::Laplacian => tools::laplacian(phase, &slot.dir, paths),
            UnwrappingAlgorithm::Romeo | UnwrappingAlgorithm::RomeoB0 => {
                tools::romeo(phase, mag.as_deref(), echo_times[e], &slot.dir, paths)
            }
        };
        let mut inputs = vec![phase.clone()];
        inputs.extend(mag);
        unwrapped.push(Builder::first_output(b.external(slot, inputs, inv))?);
    }
    Ok(unwrapped)
}
