//! Region dissimilarity kernel
//!
//! Pure functions over region statistics plus an explicit parameter bundle,
//! so every criterion is testable in isolation. Results are computed in f64
//! and coarsened to f32 at the comparison boundary; the std-dev variance
//! intermediate is deliberately squeezed through f32 as well, which keeps
//! merge ordering stable across platforms and build configurations.

use std::cell::Cell;

use serde::{Deserialize, Serialize};

use crate::config::{
    DerivedParams, EdgeDissimOption, Normalization, SegConfig, SMALL_EPSILON,
};
use crate::error::{SegResult, SegmentationError};
use crate::pixel::PixelStore;
use crate::region::RegionClass;

/// Dissimilarity criterion selector (wire numbering 1..=10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DissimCrit {
    /// 1-norm of the mean difference
    OneNorm,
    /// 2-norm of the mean difference
    TwoNorm,
    /// Infinity-norm of the mean difference
    InfNorm,
    /// Spectral angle mapper
    SpectralAngle,
    /// Spectral information divergence
    SpectralInfoDiv,
    /// Band-sum mean squared error
    BandSumMse,
    /// Band-max mean squared error
    BandMaxMse,
    /// Normalized vector distance
    NormVectorDist,
    /// Entropy
    Entropy,
    /// SAR speckle noise criterion
    SarSpeckle,
}

impl DissimCrit {
    /// Criterion from its 1-based wire number.
    pub fn from_index(index: u8) -> SegResult<Self> {
        Ok(match index {
            1 => Self::OneNorm,
            2 => Self::TwoNorm,
            3 => Self::InfNorm,
            4 => Self::SpectralAngle,
            5 => Self::SpectralInfoDiv,
            6 => Self::BandSumMse,
            7 => Self::BandMaxMse,
            8 => Self::NormVectorDist,
            9 => Self::Entropy,
            10 => Self::SarSpeckle,
            other => {
                return Err(SegmentationError::config_error(format!(
                    "dissim_crit {other} out of range 1..=10"
                )))
            }
        })
    }

    pub fn index(&self) -> u8 {
        match self {
            Self::OneNorm => 1,
            Self::TwoNorm => 2,
            Self::InfNorm => 3,
            Self::SpectralAngle => 4,
            Self::SpectralInfoDiv => 5,
            Self::BandSumMse => 6,
            Self::BandMaxMse => 7,
            Self::NormVectorDist => 8,
            Self::Entropy => 9,
            Self::SarSpeckle => 10,
        }
    }
}

/// Parameter bundle consumed by the kernel
#[derive(Debug, Clone)]
pub struct DissimParams {
    pub crit: DissimCrit,
    pub nbands: usize,
    pub mse_sqrt: bool,
    pub normind: Normalization,
    /// The local std-dev feature participates in dissimilarity
    pub std_dev_image: bool,
    pub std_dev_wght: f64,
    pub mean_norm_std_dev: bool,
    pub merge_accel: bool,
    pub min_npixels: u32,
    pub spclust_wght: f64,
    /// Initial-merge special handling is active for this run
    pub initial_merge: bool,
    pub edge_image: bool,
    pub edge_wght: f32,
    pub edge_power: f32,
    pub edge_dissim_option: EdgeDissimOption,
    pub min_edge_value: f32,
    pub max_edge_value: f32,
    /// Mean normalized value per band, for the entropy criterion
    pub meanval: Vec<f64>,
    /// First-merge growth refuses candidates above this edge value
    pub edge_threshold: f32,
    /// NaN/Inf clamps observed by the kernel
    degeneracies: Cell<u64>,
}

impl DissimParams {
    pub fn new(
        config: &SegConfig,
        derived: &DerivedParams,
        store: &PixelStore,
        min_npixels: u32,
    ) -> Self {
        let std_dev_crit_ok = !matches!(
            config.dissim_crit,
            DissimCrit::SpectralInfoDiv | DissimCrit::Entropy
        );
        Self {
            crit: config.dissim_crit,
            nbands: store.nbands(),
            mse_sqrt: config.mse_sqrt,
            normind: config.normind,
            std_dev_image: store.has_local_std_dev()
                && config.std_dev_wght > 0.0
                && std_dev_crit_ok
                && derived.region_sumsq_flag,
            std_dev_wght: config.std_dev_wght,
            mean_norm_std_dev: config.mean_norm_std_dev,
            merge_accel: config.merge_accel_flag,
            min_npixels,
            spclust_wght: config.effective_spclust_wght(),
            initial_merge: config.initial_merge_npix > 0,
            edge_image: store.has_edge_image(),
            edge_wght: config.edge_wght,
            edge_power: config.edge_power,
            edge_dissim_option: config.edge_dissim_option,
            min_edge_value: store.min_edge_value(),
            max_edge_value: store.max_edge_value(),
            meanval: (0..store.nbands()).map(|b| store.meanval(b)).collect(),
            edge_threshold: config.edge_threshold,
            degeneracies: Cell::new(0),
        }
    }

    /// Number of NaN/Inf results clamped to +inf so far
    pub fn degeneracy_count(&self) -> u64 {
        self.degeneracies.get()
    }

    fn clamp(&self, result: f64) -> f64 {
        if result.is_nan() || result.is_infinite() {
            log::warn!("non-finite dissimilarity clamped to +inf");
            self.degeneracies.set(self.degeneracies.get() + 1);
            return f64::MAX;
        }
        result
    }
}

/// One pass of the criterion formula over per-band "means" delivered by the
/// closures. `sum1`/`sum2` are only consulted by the entropy criterion.
fn criterion_core(
    p: &DissimParams,
    npix1: f64,
    npix2: f64,
    mean1: impl Fn(usize) -> f64,
    mean2: impl Fn(usize) -> f64,
    sum1: impl Fn(usize) -> f64,
    sum2: impl Fn(usize) -> f64,
) -> f64 {
    let nbands = p.nbands;
    let reg_npix = npix1 + npix2;

    let mut sumsqdiff = 0.0f64;
    let mut norm1 = 0.0f64;
    let mut norm2 = 0.0f64;
    let mut scalar_prod = 0.0f64;
    let mut entropy = 0.0f64;

    for band in 0..nbands {
        let m1 = mean1(band);
        let m2 = mean2(band);
        match p.crit {
            DissimCrit::SpectralAngle | DissimCrit::NormVectorDist => {
                norm1 += m1 * m1;
                norm2 += m2 * m2;
                scalar_prod += m1 * m2;
            }
            DissimCrit::SpectralInfoDiv => {
                norm1 += m1;
                norm2 += m2;
            }
            DissimCrit::Entropy => {
                let reg_sum = sum1(band) + sum2(band);
                let reg_mean = reg_sum / reg_npix;
                let mut term =
                    sum1(band) * m1.ln() + sum2(band) * m2.ln() - reg_sum * reg_mean.ln();
                if p.normind == Normalization::None {
                    term /= p.meanval[band];
                }
                entropy += term;
            }
            _ => {
                let mut diff = m1 - m2;
                match p.crit {
                    DissimCrit::TwoNorm | DissimCrit::BandSumMse | DissimCrit::BandMaxMse => {
                        diff *= diff;
                    }
                    _ => diff = diff.abs(),
                }
                if p.crit == DissimCrit::SarSpeckle {
                    diff /= npix1 * m1 + npix2 * m2;
                }
                match p.crit {
                    DissimCrit::InfNorm | DissimCrit::BandMaxMse => {
                        if diff > sumsqdiff {
                            sumsqdiff = diff;
                        }
                    }
                    _ => sumsqdiff += diff,
                }
            }
        }
    }

    match p.crit {
        // The cosine ratio can drift a hair past 1 for identical vectors;
        // clamp so bit-equal means stay at exactly zero dissimilarity.
        DissimCrit::SpectralAngle => {
            (scalar_prod / (norm1 * norm2).sqrt()).clamp(-1.0, 1.0).acos()
        }
        DissimCrit::NormVectorDist => {
            let half_pi = std::f64::consts::FRAC_PI_2;
            let angle = (scalar_prod / (norm1 * norm2).sqrt())
                .clamp(-1.0, 1.0)
                .acos();
            let result = (half_pi - angle) / half_pi;
            let ratio = if norm1 == 0.0 && norm2 == 0.0 {
                1.0
            } else {
                let r1 = if norm2 != 0.0 { norm1 / norm2 } else { f64::MAX };
                let r2 = if norm1 != 0.0 { norm2 / norm1 } else { f64::MAX };
                r1.min(r2)
            };
            1.0 - ratio * result
        }
        DissimCrit::SpectralInfoDiv => {
            let mut result = 0.0;
            for band in 0..nbands {
                let m1 = mean1(band) / norm1;
                let m2 = mean2(band) / norm2;
                if m1 / m2 < 1.0 {
                    result += m2 * (m2 / m1).ln() - m1 * (m1 / m2).ln();
                } else {
                    result += m1 * (m1 / m2).ln() - m2 * (m2 / m1).ln();
                }
            }
            result
        }
        // Plain comparison so a NaN entropy survives to the +inf clamp.
        DissimCrit::Entropy => {
            if entropy < 0.0 {
                0.0
            } else {
                entropy
            }
        }
        _ => {
            let mut result = sumsqdiff;
            if p.crit == DissimCrit::TwoNorm {
                result = result.sqrt();
            }
            if matches!(p.crit, DissimCrit::BandSumMse | DissimCrit::BandMaxMse) {
                result *= npix1 * npix2;
                result /= npix1 + npix2;
                if p.mse_sqrt {
                    result = result.sqrt();
                }
            }
            if p.crit == DissimCrit::SarSpeckle {
                result *= (npix1 * npix2 * (npix1 + npix2)).sqrt();
            }
            result
        }
    }
}

/// Dissimilarity between two regions, with optional std-dev augmentation and
/// small-region merge acceleration.
pub fn region_dissim(
    region1: &RegionClass,
    region2: &RegionClass,
    p: &DissimParams,
    merge_accel: bool,
) -> f64 {
    let npix1 = region1.npix() as f64;
    let npix2 = region2.npix() as f64;

    let mut result = criterion_core(
        p,
        npix1,
        npix2,
        |b| region1.sum(b) / npix1,
        |b| region2.sum(b) / npix2,
        |b| region1.sum(b),
        |b| region2.sum(b),
    );

    if p.std_dev_image
        && result < f64::MAX
        && !matches!(p.crit, DissimCrit::SpectralInfoDiv | DissimCrit::Entropy)
    {
        let std_dev_result = criterion_core(
            p,
            npix1,
            npix2,
            |b| region1.std_dev(b, p.mean_norm_std_dev),
            |b| region2.std_dev(b, p.mean_norm_std_dev),
            |b| region1.sum(b),
            |b| region2.sum(b),
        );
        result += p.std_dev_wght * std_dev_result;
    }

    if merge_accel
        && (region1.npix() < p.min_npixels || region2.npix() < p.min_npixels)
    {
        let n1 = (region1.npix().min(p.min_npixels)) as f64;
        let n2 = (region2.npix().min(p.min_npixels)) as f64;
        let max_npix = n1.max(n2);
        let factor = (2.0 * n1 * n2 / (max_npix * (n1 + n2))).sqrt();
        result *= factor;
    }

    if result < SMALL_EPSILON {
        result = 0.0;
    }
    p.clamp(result)
}

/// Dissimilarity between a region and a single pixel (treated as an
/// npix = 1 region); used by the first-merge grower.
pub fn region_pixel_dissim(
    region: &RegionClass,
    store: &PixelStore,
    pixel: usize,
    p: &DissimParams,
) -> f64 {
    // Zero-threshold growth never crosses a detected edge.
    if p.edge_image && p.edge_threshold > 0.0 && store.edge_mask(pixel) {
        if store.edge_value(pixel) > p.edge_threshold {
            return f64::MAX;
        }
    }

    let npix1 = region.npix() as f64;
    let mut result = criterion_core(
        p,
        npix1,
        1.0,
        |b| region.sum(b) / npix1,
        |b| store.value(pixel, b) as f64,
        |b| region.sum(b),
        |b| store.value(pixel, b) as f64,
    );
    if result < SMALL_EPSILON {
        result = 0.0;
    }
    p.clamp(result)
}

/// Edge modulation factor for a neighbor pair whose larger regional edge
/// maximum is `max_edge`.
pub(crate) fn edge_factor(max_edge: f32, p: &DissimParams) -> f64 {
    let mut edge_result = max_edge;
    if edge_result < 0.0 {
        edge_result = match p.edge_dissim_option {
            EdgeDissimOption::MergeEnhance => p.max_edge_value,
            EdgeDissimOption::MergeSuppress => p.min_edge_value,
        };
    }
    let span = (p.max_edge_value - p.min_edge_value) as f64;
    let mut factor = ((edge_result - p.min_edge_value) as f64 / span)
        .powf(p.edge_power as f64);
    factor = (1.0 - p.edge_wght as f64) + factor * p.edge_wght as f64;
    if p.edge_dissim_option == EdgeDissimOption::MergeSuppress {
        factor = (p.spclust_wght + (1.0 - p.spclust_wght) * factor) / p.spclust_wght;
    }
    factor
}

/// Full neighbor-channel dissimilarity: base criterion plus the
/// initial-merge special case and edge modulation, coarsened to f32.
pub(crate) fn neighbor_dissim(
    region1: &RegionClass,
    region2: &RegionClass,
    p: &DissimParams,
) -> f32 {
    let mut result = region_dissim(region1, region2, p, p.merge_accel);

    let mut edge_process = p.edge_image && p.edge_wght > 0.0;
    if p.initial_merge && !region1.seam_flag() && !region2.seam_flag() {
        if region1.initial_merge_flag() && region2.initial_merge_flag() {
            if p.spclust_wght > 0.0 {
                result /= p.spclust_wght;
            }
            edge_process = false;
        }
    }
    if edge_process {
        let max_edge = region1.max_edge_value().max(region2.max_edge_value());
        result *= edge_factor(max_edge, p);
    }
    p.clamp(result) as f32
}

/// Region-channel (spectral clustering) dissimilarity, coarsened to f32.
pub(crate) fn region_channel_dissim(
    region1: &RegionClass,
    region2: &RegionClass,
    p: &DissimParams,
) -> f32 {
    region_dissim(region1, region2, p, false) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dims, SegConfig};
    use crate::pixel::Raster;

    fn params_for(crit: DissimCrit) -> DissimParams {
        let config = SegConfig {
            dissim_crit: crit,
            normind: Normalization::None,
            ..SegConfig::default()
        };
        let raster = Raster {
            dims: Dims::new_1d(4),
            nbands: 2,
            bands: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            mask: None,
            local_std_dev: None,
            edge_value: None,
            edge_mask: None,
            region_map: None,
        };
        let store = PixelStore::new(&raster, &config).unwrap();
        let derived = DerivedParams::derive(&config, store.dims()).unwrap();
        DissimParams::new(&config, &derived, &store, 1)
    }

    fn region_with(label: u32, npix: u32, means: &[f64]) -> RegionClass {
        let mut r = RegionClass::new(label, means.len(), false, false, false);
        r.seed_for_test(npix, means);
        r
    }

    #[test]
    fn criterion_indices_round_trip() {
        for index in 1..=10u8 {
            assert_eq!(DissimCrit::from_index(index).unwrap().index(), index);
        }
        assert!(DissimCrit::from_index(0).is_err());
        assert!(DissimCrit::from_index(11).is_err());
    }

    #[test]
    fn all_criteria_are_symmetric() {
        let a = region_with(1, 3, &[0.4, 1.7]);
        let b = region_with(2, 5, &[1.1, 0.3]);
        for index in 1..=10u8 {
            let p = params_for(DissimCrit::from_index(index).unwrap());
            let d_ab = region_dissim(&a, &b, &p, false);
            let d_ba = region_dissim(&b, &a, &p, false);
            assert!(
                (d_ab - d_ba).abs() < 1e-9,
                "criterion {index} asymmetric: {d_ab} vs {d_ba}"
            );
        }
    }

    #[test]
    fn identical_means_give_zero() {
        let a = region_with(1, 3, &[0.9, 2.5]);
        let b = region_with(2, 7, &[0.9, 2.5]);
        for index in 1..=10u8 {
            let p = params_for(DissimCrit::from_index(index).unwrap());
            assert_eq!(
                region_dissim(&a, &b, &p, false),
                0.0,
                "criterion {index} nonzero for equal means"
            );
        }
    }

    #[test]
    fn one_norm_sums_band_differences() {
        let a = region_with(1, 2, &[1.0, 4.0]);
        let b = region_with(2, 2, &[3.0, 1.0]);
        let p = params_for(DissimCrit::OneNorm);
        assert!((region_dissim(&a, &b, &p, false) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn inf_norm_takes_band_maximum() {
        let a = region_with(1, 2, &[1.0, 4.0]);
        let b = region_with(2, 2, &[3.0, 1.0]);
        let p = params_for(DissimCrit::InfNorm);
        assert!((region_dissim(&a, &b, &p, false) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn mse_weighting_and_sqrt_policy() {
        let a = region_with(1, 2, &[1.0]);
        let b = region_with(2, 2, &[5.0]);
        let mut p = params_for(DissimCrit::BandSumMse);
        p.nbands = 1;
        // (1-5)^2 * (2*2)/(2+2) = 16, then sqrt under the default policy.
        assert!((region_dissim(&a, &b, &p, false) - 4.0).abs() < 1e-9);
        p.mse_sqrt = false;
        assert!((region_dissim(&a, &b, &p, false) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn merge_accel_shrinks_small_region_dissim() {
        let a = region_with(1, 1, &[1.0, 1.0]);
        let b = region_with(2, 8, &[2.0, 2.0]);
        let mut p = params_for(DissimCrit::OneNorm);
        p.min_npixels = 4;
        let plain = region_dissim(&a, &b, &p, false);
        let accel = region_dissim(&a, &b, &p, true);
        // factor = sqrt(2*1*4 / (4*5)) for clamped sizes 1 and 4
        let factor = (2.0f64 * 1.0 * 4.0 / (4.0 * 5.0)).sqrt();
        assert!((accel - plain * factor).abs() < 1e-9);
    }

    #[test]
    fn spectral_angle_matches_closed_form() {
        let a = region_with(1, 2, &[1.0, 0.0]);
        let b = region_with(2, 2, &[1.0, 1.0]);
        let p = params_for(DissimCrit::SpectralAngle);
        let expected = std::f64::consts::FRAC_PI_4;
        assert!((region_dissim(&a, &b, &p, false) - expected).abs() < 1e-9);
    }

    #[test]
    fn degenerate_entropy_clamps_to_max() {
        // A zero mean under the entropy criterion drives ln() to -inf.
        let a = region_with(1, 2, &[0.0, 1.0]);
        let b = region_with(2, 2, &[1.0, 1.0]);
        let p = params_for(DissimCrit::Entropy);
        let d = region_dissim(&a, &b, &p, false);
        assert_eq!(d, f64::MAX);
        assert_eq!(p.degeneracy_count(), 1);
    }

    #[test]
    fn tiny_results_floor_to_zero() {
        let a = region_with(1, 2, &[1.0, 1.0]);
        let b = region_with(2, 2, &[1.0 + 1e-13, 1.0]);
        let p = params_for(DissimCrit::OneNorm);
        assert_eq!(region_dissim(&a, &b, &p, false), 0.0);
    }

    #[test]
    fn suppress_option_inflates_dissimilarity_at_edges() {
        let mut p = params_for(DissimCrit::BandSumMse);
        p.edge_image = true;
        p.edge_wght = 1.0;
        p.edge_power = 1.0;
        p.min_edge_value = 0.0;
        p.max_edge_value = 1.0;
        p.spclust_wght = 0.5;
        p.edge_dissim_option = EdgeDissimOption::MergeSuppress;
        // Maximum edge evidence: factor (w + (1-w)*1)/w = 2.
        assert!((edge_factor(1.0, &p) - 2.0).abs() < 1e-9);
        // No edge evidence: factor (0.5 + 0.5*0)/0.5 = 1.
        assert!((edge_factor(0.0, &p) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn enhance_option_shrinks_dissimilarity_away_from_edges() {
        let mut p = params_for(DissimCrit::BandSumMse);
        p.edge_image = true;
        p.edge_wght = 0.5;
        p.edge_power = 1.0;
        p.min_edge_value = 0.0;
        p.max_edge_value = 1.0;
        p.edge_dissim_option = EdgeDissimOption::MergeEnhance;
        assert!((edge_factor(0.0, &p) - 0.5).abs() < 1e-9);
        assert!((edge_factor(1.0, &p) - 1.0).abs() < 1e-9);
    }
}
