pub mod average;
pub mod morphology;
pub mod resample;
pub mod threshold;

pub use average::{fuse_two_pass, nonzero_average};
pub use morphology::{erode_binary, fill_holes, fill_holes_morphological};
pub use resample::{resample_affine, resample_like, Interpolation};
pub use threshold::{histogram_threshold, otsu_threshold, percentile, ThresholdAlgorithm};
