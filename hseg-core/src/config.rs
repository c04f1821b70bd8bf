//! Configuration types for the segmentation engine

use serde::{Deserialize, Serialize};

use crate::dissim::DissimCrit;
use crate::error::{SegResult, SegmentationError};

/// Maximum number of pixels allowed in the processing window at the deepest
/// recursive level (bounds the initial region count per window).
pub const MAX_NREGIONS: usize = 1_048_576;

/// Maximum number of pixels in a processing window at the data I/O level of
/// recursion.
pub const MAX_NPIXELS: usize = 262_144;

/// Dissimilarity values below this are treated as exactly zero.
pub const SMALL_EPSILON: f64 = 1.0e-10;

/// Minimum number of sampled seam pixels for a seam pair to be considered in
/// artifact elimination.
pub const MIN_SEAM_EDGE_NPIX: u32 = 3;

/// Top-level program mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramMode {
    /// Hierarchical step-wise optimal region growing only (no spectral clustering)
    Hswo,
    /// Hybrid region growing plus spectral clustering, single processing window
    Hseg,
    /// Recursive windowed HSEG with seam artifact elimination
    Rhseg,
}

/// Input data normalization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    /// Use the input data as-is
    None,
    /// One common scale factor across all bands
    AcrossBands,
    /// Independent scale factor per band
    PerBand,
}

/// How the edge image modulates neighbor dissimilarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeDissimOption {
    /// Low edge values shrink dissimilarity (favor merges away from edges)
    MergeEnhance,
    /// High edge values inflate dissimilarity (suppress merges across edges)
    MergeSuppress,
}

/// User-facing configuration for a segmentation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegConfig {
    /// Program mode: HSWO, HSEG or RHSEG
    pub program_mode: ProgramMode,

    /// Dissimilarity criterion (see [`DissimCrit`])
    pub dissim_crit: DissimCrit,

    /// Input normalization mode
    pub normind: Normalization,

    /// Neighbor connectivity type (1-based; 1-D: 1..=4, 2-D: 1..=5, 3-D: 1..=3)
    pub conn_type: u8,

    /// Spectral clustering weight in [0, 1]; 0 disables the region heap
    pub spclust_wght: f64,

    /// Lower bound on the spectral clustering candidate population
    pub spclust_min: u32,

    /// Upper bound on the spectral clustering candidate population
    pub spclust_max: u32,

    /// Region count target for sub-window (non-root) convergence
    pub min_nregions: u32,

    /// Region count at which the run converges
    pub conv_nregions: u32,

    /// Region count at which hierarchy output begins (continuous mode)
    pub chk_nregions: Option<u32>,

    /// Explicit region-count levels at which to emit hierarchy snapshots
    pub hseg_out_nregions: Vec<u32>,

    /// Explicit merge-threshold levels at which to emit hierarchy snapshots
    pub hseg_out_thresholds: Vec<f32>,

    /// First-merge dissimilarity threshold (0.0 grows only exact matches)
    pub init_threshold: f32,

    /// Edge value above which first-merge growth is blocked
    pub edge_threshold: f32,

    /// Exponent applied to the normalized edge factor
    pub edge_power: f32,

    /// Weight of the edge factor in neighbor dissimilarity, in [0, 1]
    pub edge_wght: f32,

    /// Edge modulation flavor
    pub edge_dissim_option: EdgeDissimOption,

    /// Mean-seam-edge threshold gating seam artifact-elimination merges
    pub seam_edge_threshold: f32,

    /// Regions at least this large after first merge are flagged as
    /// initial-merge regions
    pub initial_merge_npix: u32,

    /// Seed the first-merge shuffle from OS entropy instead of a fixed seed
    pub random_init_seed_flag: bool,

    /// Sort region labels by size in emitted snapshots
    pub sort_flag: bool,

    /// Accelerate merges involving small regions
    pub merge_accel_flag: bool,

    /// Weight of the std-dev augmentation term in region dissimilarity
    pub std_dev_wght: f64,

    /// Floor for spectral clustering eligibility; adapted upward at run time
    pub min_npixels: u32,

    /// Number of recursive levels (0 = derive from image size)
    pub rnb_levels: u16,

    /// Number of data I/O recursive levels (0 = derive from image size)
    pub ionb_levels: u16,

    /// Take the square root of the MSE criteria (dimensional consistency)
    pub mse_sqrt: bool,

    /// Report mean-normalized standard deviations
    pub mean_norm_std_dev: bool,

    /// Emit per-region sums in hierarchy snapshots
    pub region_sum_flag: bool,

    /// Emit per-region standard deviations in hierarchy snapshots
    pub region_std_dev_flag: bool,

    /// Emit per-region boundary pixel counts in hierarchy snapshots
    pub region_boundary_npix_flag: bool,

    /// Emit per-region merge thresholds in hierarchy snapshots
    pub region_threshold_flag: bool,

    /// Emit per-region neighbor lists in hierarchy snapshots
    pub region_nghbrs_list_flag: bool,
}

impl Default for SegConfig {
    fn default() -> Self {
        Self {
            program_mode: ProgramMode::Hseg,
            dissim_crit: DissimCrit::BandSumMse,
            normind: Normalization::PerBand,
            conn_type: 2,
            spclust_wght: 0.0,
            spclust_min: 512,
            spclust_max: 1024,
            min_nregions: 512,
            conv_nregions: 2,
            chk_nregions: None,
            hseg_out_nregions: Vec::new(),
            hseg_out_thresholds: Vec::new(),
            init_threshold: 0.0,
            edge_threshold: 0.05,
            edge_power: 1.0,
            edge_wght: 1.0,
            edge_dissim_option: EdgeDissimOption::MergeSuppress,
            seam_edge_threshold: 0.05,
            initial_merge_npix: 0,
            random_init_seed_flag: false,
            sort_flag: true,
            merge_accel_flag: false,
            std_dev_wght: 1.0,
            min_npixels: 1,
            rnb_levels: 0,
            ionb_levels: 0,
            mse_sqrt: true,
            mean_norm_std_dev: false,
            region_sum_flag: true,
            region_std_dev_flag: false,
            region_boundary_npix_flag: false,
            region_threshold_flag: true,
            region_nghbrs_list_flag: true,
        }
    }
}

impl SegConfig {
    /// Check option ranges and cross-option consistency.
    pub fn validate(&self, dims: &Dims) -> SegResult<()> {
        let nd = dims.nb_dimensions();
        if nd == 0 {
            return Err(SegmentationError::config_error(
                "image must have at least one non-trivial dimension",
            ));
        }
        let max_conn = match nd {
            1 => 4,
            2 => 5,
            _ => 3,
        };
        if self.conn_type < 1 || self.conn_type > max_conn {
            return Err(SegmentationError::config_error(format!(
                "conn_type {} out of range 1..={} for {}-D data",
                self.conn_type, max_conn, nd
            )));
        }
        if !(0.0..=1.0).contains(&self.spclust_wght) {
            return Err(SegmentationError::config_error(format!(
                "spclust_wght {} out of range [0, 1]",
                self.spclust_wght
            )));
        }
        if !(0.0..=1.0).contains(&self.edge_wght) {
            return Err(SegmentationError::config_error(format!(
                "edge_wght {} out of range [0, 1]",
                self.edge_wght
            )));
        }
        if self.conv_nregions == 0 {
            return Err(SegmentationError::config_error(
                "conv_nregions must be at least 1",
            ));
        }
        if self.spclust_min > self.spclust_max {
            return Err(SegmentationError::config_error(format!(
                "spclust_min {} exceeds spclust_max {}",
                self.spclust_min, self.spclust_max
            )));
        }
        if self.min_npixels > self.spclust_max {
            return Err(SegmentationError::config_error(format!(
                "min_npixels {} exceeds spclust_max {}",
                self.min_npixels, self.spclust_max
            )));
        }
        if !self.hseg_out_nregions.is_empty() && !self.hseg_out_thresholds.is_empty() {
            return Err(SegmentationError::config_error(
                "hseg_out_nregions and hseg_out_thresholds are mutually exclusive",
            ));
        }
        for w in self.hseg_out_nregions.windows(2) {
            if w[1] >= w[0] {
                return Err(SegmentationError::config_error(
                    "hseg_out_nregions must be strictly decreasing",
                ));
            }
        }
        for w in self.hseg_out_thresholds.windows(2) {
            if w[1] <= w[0] {
                return Err(SegmentationError::config_error(
                    "hseg_out_thresholds must be strictly increasing",
                ));
            }
        }
        Ok(())
    }

    /// Effective spectral clustering weight: HSWO mode forces it to zero.
    pub fn effective_spclust_wght(&self) -> f64 {
        match self.program_mode {
            ProgramMode::Hswo => 0.0,
            _ => self.spclust_wght,
        }
    }
}

/// Image dimensions; any dimension of size 1 is treated as absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dims {
    pub ncols: usize,
    pub nrows: usize,
    pub nslices: usize,
}

impl Dims {
    pub fn new_1d(ncols: usize) -> Self {
        Self {
            ncols,
            nrows: 1,
            nslices: 1,
        }
    }

    pub fn new_2d(ncols: usize, nrows: usize) -> Self {
        Self {
            ncols,
            nrows,
            nslices: 1,
        }
    }

    pub fn new_3d(ncols: usize, nrows: usize, nslices: usize) -> Self {
        Self {
            ncols,
            nrows,
            nslices,
        }
    }

    pub fn npixels(&self) -> usize {
        self.ncols * self.nrows * self.nslices
    }

    /// Number of dimensions larger than one
    pub fn nb_dimensions(&self) -> u8 {
        let mut nd = 0;
        if self.ncols > 1 {
            nd += 1;
        }
        if self.nrows > 1 {
            nd += 1;
        }
        if self.nslices > 1 {
            nd += 1;
        }
        nd
    }
}

/// Which dimensions are split when descending one recursive level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurMask {
    pub col: bool,
    pub row: bool,
    pub slice: bool,
}

/// Parameters derived from the configuration and the image dimensions
#[derive(Debug, Clone)]
pub struct DerivedParams {
    /// Number of neighbor directions used for region adjacency
    pub maxnbdir: usize,

    /// Number of non-trivial image dimensions
    pub nb_dimensions: u8,

    /// Recursive levels; level 0 is the full image
    pub rnb_levels: u16,

    /// Data I/O recursive levels
    pub ionb_levels: u16,

    /// Split mask per recursive level (index 0 = root)
    pub recur_masks: Vec<RecurMask>,

    /// Width of the seam band on each side of a processing-window boundary
    pub seam_size: usize,

    /// Whether per-band sums of squares must be accumulated
    pub region_sumsq_flag: bool,

    /// Whether per-band x log x sums must be accumulated
    pub region_sumxlogx_flag: bool,
}

impl DerivedParams {
    /// Derive engine parameters from the configuration and image dimensions.
    pub fn derive(config: &SegConfig, dims: &Dims) -> SegResult<Self> {
        config.validate(dims)?;
        let nb_dimensions = dims.nb_dimensions();
        let maxnbdir = maxnbdir_for(nb_dimensions, config.conn_type)?;

        let seam_size = match nb_dimensions {
            1 => 8,
            2 => 4,
            _ => 2,
        };

        let (rnb_levels, recur_masks) = derive_recursion(config, dims);
        let ionb_levels = derive_ionb_levels(config, dims, rnb_levels, &recur_masks);

        // The std-dev feature never pairs with criteria that have no
        // meaningful std-dev analogue.
        let std_dev_crit_ok = !matches!(
            config.dissim_crit,
            DissimCrit::SpectralInfoDiv | DissimCrit::Entropy
        );

        let region_sumsq_flag = config.region_std_dev_flag
            || config.mean_norm_std_dev
            || (config.std_dev_wght > 0.0 && std_dev_crit_ok);
        let region_sumxlogx_flag = config.dissim_crit == DissimCrit::Entropy;

        log::debug!(
            "derived params: maxnbdir={} rnb_levels={} ionb_levels={} seam_size={}",
            maxnbdir,
            rnb_levels,
            ionb_levels,
            seam_size
        );

        Ok(Self {
            maxnbdir,
            nb_dimensions,
            rnb_levels,
            ionb_levels,
            recur_masks,
            seam_size,
            region_sumsq_flag,
            region_sumxlogx_flag,
        })
    }
}

fn maxnbdir_for(nb_dimensions: u8, conn_type: u8) -> SegResult<usize> {
    let maxnbdir = match nb_dimensions {
        1 => match conn_type {
            1 => 2,
            2 => 4,
            3 => 6,
            4 => 8,
            _ => 0,
        },
        2 => match conn_type {
            1 => 4,
            2 => 8,
            3 => 12,
            4 => 20,
            5 => 24,
            _ => 0,
        },
        _ => match conn_type {
            1 => 6,
            2 => 18,
            3 => 26,
            _ => 0,
        },
    };
    if maxnbdir == 0 {
        return Err(SegmentationError::config_error(format!(
            "unsupported conn_type {} for {}-D data",
            conn_type, nb_dimensions
        )));
    }
    Ok(maxnbdir)
}

/// Halve the largest dimensions until the deepest window fits the region
/// budget, recording which dimensions split at each level.
fn derive_recursion(config: &SegConfig, dims: &Dims) -> (u16, Vec<RecurMask>) {
    if config.program_mode != ProgramMode::Rhseg {
        return (1, vec![RecurMask::default()]);
    }

    let mut cur = [dims.ncols, dims.nrows, dims.nslices];
    let mut masks: Vec<RecurMask> = Vec::new();

    let split_budget = |cur: &[usize; 3]| cur[0] * cur[1] * cur[2] > MAX_NREGIONS;
    let user_levels = config.rnb_levels;

    loop {
        let deep_enough = if user_levels > 0 {
            masks.len() + 1 >= user_levels as usize
        } else {
            !split_budget(&cur)
        };
        let npix = cur[0] * cur[1] * cur[2];
        // Never split below the sub-window convergence budget.
        if deep_enough || npix <= config.min_nregions as usize {
            break;
        }

        let prime = (0..3).max_by_key(|&d| cur[d]).unwrap_or(0);
        let half = (cur[prime] + 1) / 2;
        let mut split = [false; 3];
        for (d, flag) in split.iter_mut().enumerate() {
            if (d == prime || cur[d] > half) && cur[d] > 1 {
                *flag = true;
                cur[d] = (cur[d] + 1) / 2;
            }
        }
        masks.push(RecurMask {
            col: split[0],
            row: split[1],
            slice: split[2],
        });
    }

    // The deepest level never splits further.
    masks.push(RecurMask::default());
    (masks.len() as u16, masks)
}

fn derive_ionb_levels(
    config: &SegConfig,
    dims: &Dims,
    rnb_levels: u16,
    masks: &[RecurMask],
) -> u16 {
    if config.ionb_levels > 0 {
        return config.ionb_levels.min(rnb_levels);
    }
    let mut cur = [dims.ncols, dims.nrows, dims.nslices];
    let mut level: u16 = 1;
    for mask in masks {
        if cur[0] * cur[1] * cur[2] <= MAX_NPIXELS {
            break;
        }
        if mask.col {
            cur[0] = (cur[0] + 1) / 2;
        }
        if mask.row {
            cur[1] = (cur[1] + 1) / 2;
        }
        if mask.slice {
            cur[2] = (cur[2] + 1) / 2;
        }
        level += 1;
    }
    level.min(rnb_levels)
}
