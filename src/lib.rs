//! QSM-Pipeline: Quantitative Susceptibility Mapping reconstruction
//!
//! Turns BIDS-organized multi-echo gradient-echo magnitude/phase data into
//! susceptibility maps (ppm) by planning a per-Run graph of stages and
//! executing it on a bounded worker pool.
//!
//! # Modules
//! - `volume`, `nifti_io`: volumes, affines and NIfTI I/O
//! - `utils`: thresholds, morphology, resampling, averaging
//! - `phase`: phase scaling, axial resampling, unit conversions, echo combination
//! - `masking`: tight/filled mask pairs
//! - `config`: premades, option merging, per-Run plans
//! - `discovery`, `planner`: finding and validating Runs
//! - `tools`: external program adapters
//! - `graph`, `stages`, `scheduler`: building and executing the reconstruction DAG
//! - `sidecar`, `logging`, `cli`: JSON sidecars, log setup, command line

// Core modules
pub mod error;
pub mod nifti_io;
pub mod utils;
pub mod volume;

// Reconstruction
pub mod masking;
pub mod phase;
pub mod sidecar;
pub mod stages;

// Planning and execution
pub mod config;
pub mod discovery;
pub mod graph;
pub mod planner;
pub mod scheduler;
pub mod tools;

// Front end
pub mod cli;
pub mod logging;

pub use error::{FailureKind, QsmError, Result};
pub use volume::Volume;
