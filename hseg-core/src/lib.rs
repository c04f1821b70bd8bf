//! # hseg-core
//!
//! Recursive hierarchical image segmentation (HSWO / HSeg / RHSeg).
//! Given a multiband raster this library produces a hierarchy of
//! segmentations: fine regions at the bottom, progressively coarser ones
//! above, forming a strict merge tree. The engine combines step-wise
//! optimal region growing with optional spectral clustering, and in RHSEG
//! mode processes the image in recursive windows with edge-gated seam
//! merges to suppress window artifacts.

pub mod config;
pub mod connectivity;
pub mod dissim;
pub mod driver;
pub mod error;
pub mod grow;
pub mod heap;
pub mod hierarchy;
pub mod merge;
pub mod pixel;
pub mod region;
pub mod seam;

// Re-export main types for convenience
pub use config::{
    DerivedParams, Dims, EdgeDissimOption, Normalization, ProgramMode, SegConfig,
};
pub use dissim::{DissimCrit, DissimParams};
pub use driver::{SegOutput, Segmenter};
pub use error::*;
pub use hierarchy::{Hierarchy, HierarchySnapshot, RegionSummary};
pub use merge::CorrectionCounters;
pub use pixel::{PixelStore, Raster};
pub use region::{RegionClass, RegionSeam};

/// Main entry point: segment a raster under the given configuration.
///
/// Validates the configuration against the raster dimensions, runs the
/// configured program mode and returns the emitted hierarchy together with
/// the final labeling.
///
/// # Errors
/// Returns an error for inconsistent buffer dimensions, out-of-range
/// options, or a missing edge image in RHSEG mode.
pub fn segment(raster: &Raster, config: &SegConfig) -> SegResult<SegOutput> {
    Segmenter::new(config.clone()).segment(raster)
}
