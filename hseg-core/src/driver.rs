//! Top-level segmentation driver
//!
//! Dispatches the three program modes: HSWO (neighbor merges only), HSEG
//! (hybrid with spectral clustering) and RHSEG (recursive processing
//! windows with seam artifact elimination between levels).

use std::collections::BTreeSet;

use crate::config::{DerivedParams, ProgramMode, RecurMask, SegConfig};
use crate::connectivity::SplitAxis;
use crate::dissim::DissimParams;
use crate::error::{SegResult, SegmentationError};
use crate::grow;
use crate::hierarchy::{resolve_label, Hierarchy};
use crate::merge::{self, CorrectionCounters, MergeState};
use crate::pixel::{PixelStore, Raster, WindowBounds};
use crate::seam::{self, SeamSpec};

/// Result of a full segmentation run
#[derive(Debug)]
pub struct SegOutput {
    pub hierarchy: Hierarchy,
    /// Final region-class label per pixel (0 = masked)
    pub labels: Vec<u32>,
    pub nregions: u32,
    pub max_threshold: f64,
    pub corrections: CorrectionCounters,
    /// NaN/Inf dissimilarity clamps observed by the kernel
    pub kernel_degeneracies: u64,
}

/// Segmentation engine entry point
pub struct Segmenter {
    config: SegConfig,
}

impl Segmenter {
    pub fn new(config: SegConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegConfig {
        &self.config
    }

    /// Run the configured program mode over the raster and return the
    /// hierarchy of segmentations.
    pub fn segment(&self, raster: &Raster) -> SegResult<SegOutput> {
        let derived = DerivedParams::derive(&self.config, &raster.dims)?;
        if self.config.program_mode == ProgramMode::Rhseg
            && derived.rnb_levels > 1
            && raster.edge_value.is_none()
        {
            return Err(SegmentationError::config_error(
                "RHSEG mode requires an edge image for seam artifact elimination",
            ));
        }
        log::info!(
            "starting {:?} segmentation of {}x{}x{} ({} bands), {} recursive levels",
            self.config.program_mode,
            raster.dims.ncols,
            raster.dims.nrows,
            raster.dims.nslices,
            raster.nbands,
            derived.rnb_levels
        );

        let mut store = PixelStore::new(raster, &self.config)?;
        let mut params = DissimParams::new(
            &self.config,
            &derived,
            &store,
            self.config.min_npixels.max(1),
        );
        let mut state = MergeState::new(Vec::new());
        let mut next_label = 1u32;
        let full = WindowBounds::full(store.dims());

        // An externally supplied region map seeds the table before growth.
        if raster.region_map.is_some() {
            let max_label =
                grow::region_classes_init(&store, &full, &derived, &mut state.regions);
            next_label = max_label + 1;
        }

        self.process_window(
            &mut store,
            &mut state,
            &mut next_label,
            &derived,
            &mut params,
            &full,
            0,
        )?;

        // Final stage at the root, hierarchy triggers active.
        store.relabel(|l| resolve_label(&state.regions, l));
        let labels = window_labels(&store, &full);
        merge::init_heaps_for(&mut state, &self.config, &mut params, labels);
        let mut hierarchy = Hierarchy::new();
        self.run_final(&store, &mut state, &mut params, &mut hierarchy);

        store.relabel(|l| resolve_label(&state.regions, l));
        log::info!(
            "segmentation converged at {} regions, max threshold {}",
            state.nregions,
            state.max_threshold
        );
        Ok(SegOutput {
            hierarchy,
            labels: store.labels().to_vec(),
            nregions: state.nregions,
            max_threshold: state.max_threshold,
            corrections: state.corrections,
            kernel_degeneracies: params.degeneracy_count(),
        })
    }

    /// Process one window: leaves run first-merge growth, parents join
    /// their children across the seams. Every non-root window then merges
    /// down to the sub-window budget.
    #[allow(clippy::too_many_arguments)]
    fn process_window(
        &self,
        store: &mut PixelStore,
        state: &mut MergeState,
        next_label: &mut u32,
        derived: &DerivedParams,
        params: &mut DissimParams,
        window: &WindowBounds,
        level: usize,
    ) -> SegResult<()> {
        let deepest = level + 1 >= derived.rnb_levels as usize;
        if deepest {
            grow::first_merge_region_grow(
                store,
                window,
                &self.config,
                derived,
                params,
                &mut state.regions,
                next_label,
            )?;
            grow::neighbor_sets_init(store, window, derived, &mut state.regions);
        } else {
            let mask = derived.recur_masks[level];
            for child in split_window(window, &mask) {
                self.process_window(store, state, next_label, derived, params, &child, level + 1)?;
            }
            log::debug!(
                "joining children of window at level {} ({} pixels)",
                level,
                window.npixels()
            );
            store.relabel(|l| resolve_label(&state.regions, l));
            grow::neighbor_sets_init(store, window, derived, &mut state.regions);

            let seams = seams_for(window, &mask);
            let mut seam_regions =
                seam::seam_region_classes_init(store, window, &seams, derived, &mut state.regions);
            state.nregions = window_labels(store, window).len() as u32;
            seam::merge_seam_regions(state, &mut seam_regions, self.config.seam_edge_threshold);
            store.relabel(|l| resolve_label(&state.regions, l));
        }

        if level > 0 {
            let labels = window_labels(store, window);
            merge::init_heaps_for(state, &self.config, params, labels);
            merge::run_to_target(state, &self.config, params, self.config.min_nregions, false);
            store.relabel(|l| resolve_label(&state.regions, l));
        }
        Ok(())
    }

    /// Run the root stage to final convergence, emitting snapshots at the
    /// configured trigger points.
    fn run_final(
        &self,
        store: &PixelStore,
        state: &mut MergeState,
        params: &mut DissimParams,
        hierarchy: &mut Hierarchy,
    ) {
        let config = &self.config;
        let conv = config.conv_nregions;

        if !config.hseg_out_nregions.is_empty() {
            for &target in &config.hseg_out_nregions {
                let bound = target.max(conv);
                merge::run_to_target(state, config, params, bound, true);
                if state.nregions <= bound {
                    hierarchy.emit(store, state, config);
                }
                if bound == conv {
                    break;
                }
            }
            if state.nregions > conv {
                merge::run_to_target(state, config, params, conv, true);
            }
            if hierarchy.last().map(|s| s.nregions) != Some(state.nregions) {
                hierarchy.emit(store, state, config);
            }
        } else if !config.hseg_out_thresholds.is_empty() {
            let mut pending = config.hseg_out_thresholds.iter().copied().peekable();
            loop {
                let mut crossed = false;
                while let Some(&threshold) = pending.peek() {
                    if state.max_threshold >= threshold as f64 {
                        pending.next();
                        crossed = true;
                    } else {
                        break;
                    }
                }
                if crossed {
                    hierarchy.emit(store, state, config);
                }
                if state.nregions <= conv {
                    break;
                }
                if !merge::merge_step(state, config, params, conv, true) {
                    break;
                }
            }
            if hierarchy.last().map(|s| s.nregions) != Some(state.nregions) {
                hierarchy.emit(store, state, config);
            }
        } else if let Some(chk) = config.chk_nregions {
            // Output begins at the checkpoint count and continues through
            // final convergence.
            merge::run_to_target(state, config, params, chk.max(conv), true);
            hierarchy.emit(store, state, config);
            while state.nregions > conv {
                if !merge::merge_step(state, config, params, conv, true) {
                    break;
                }
                hierarchy.emit(store, state, config);
            }
        } else {
            merge::run_to_target(state, config, params, conv, true);
            hierarchy.emit(store, state, config);
        }
    }
}

/// Distinct region labels present in the window.
fn window_labels(store: &PixelStore, window: &WindowBounds) -> Vec<u32> {
    let dims = *store.dims();
    let mut labels = BTreeSet::new();
    for pixel in window.pixels(&dims) {
        let label = store.region_label(pixel);
        if label != 0 {
            labels.insert(label);
        }
    }
    labels.into_iter().collect()
}

/// Split a window along every dimension the mask flags, rounding the lower
/// half up so child sizes match the recursion derivation.
fn split_window(window: &WindowBounds, mask: &RecurMask) -> Vec<WindowBounds> {
    let mut windows = vec![*window];
    if mask.col {
        let mid = window.col0 + (window.col1 - window.col0 + 1) / 2;
        windows = windows
            .into_iter()
            .flat_map(|w| {
                [
                    WindowBounds { col1: mid, ..w },
                    WindowBounds { col0: mid, ..w },
                ]
            })
            .collect();
    }
    if mask.row {
        let mid = window.row0 + (window.row1 - window.row0 + 1) / 2;
        windows = windows
            .into_iter()
            .flat_map(|w| {
                [
                    WindowBounds { row1: mid, ..w },
                    WindowBounds { row0: mid, ..w },
                ]
            })
            .collect();
    }
    if mask.slice {
        let mid = window.slice0 + (window.slice1 - window.slice0 + 1) / 2;
        windows = windows
            .into_iter()
            .flat_map(|w| {
                [
                    WindowBounds { slice1: mid, ..w },
                    WindowBounds { slice0: mid, ..w },
                ]
            })
            .collect();
    }
    windows
}

/// One seam per split dimension, at the boundary `split_window` used.
fn seams_for(window: &WindowBounds, mask: &RecurMask) -> Vec<SeamSpec> {
    let mut seams = Vec::new();
    if mask.col {
        seams.push(SeamSpec {
            axis: SplitAxis::Col,
            position: window.col0 + (window.col1 - window.col0 + 1) / 2,
        });
    }
    if mask.row {
        seams.push(SeamSpec {
            axis: SplitAxis::Row,
            position: window.row0 + (window.row1 - window.row0 + 1) / 2,
        });
    }
    if mask.slice {
        seams.push(SeamSpec {
            axis: SplitAxis::Slice,
            position: window.slice0 + (window.slice1 - window.slice0 + 1) / 2,
        });
    }
    seams
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dims, Normalization};
    use crate::dissim::{self, DissimCrit};
    use crate::hierarchy::HierarchySnapshot;
    use crate::region::RegionClass;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Every region of `coarse` must be a union of `fine` regions: all
    /// pixels of any fine region share one coarse label.
    fn is_refinement(fine: &HierarchySnapshot, coarse: &HierarchySnapshot) -> bool {
        let mut mapping = std::collections::HashMap::new();
        for (f, c) in fine.labels.iter().zip(coarse.labels.iter()) {
            if *f == 0 {
                continue;
            }
            match mapping.entry(*f) {
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(*c);
                }
                std::collections::hash_map::Entry::Occupied(e) => {
                    if e.get() != c {
                        return false;
                    }
                }
            }
        }
        true
    }

    #[test]
    fn constant_image_converges_immediately() {
        let raster = Raster::single_band(Dims::new_2d(4, 4), vec![2.5; 16]);
        let config = SegConfig {
            program_mode: ProgramMode::Hswo,
            dissim_crit: DissimCrit::TwoNorm,
            normind: Normalization::None,
            conv_nregions: 1,
            ..SegConfig::default()
        };
        let out = Segmenter::new(config).segment(&raster).unwrap();

        assert_eq!(out.nregions, 1);
        assert_eq!(out.max_threshold, 0.0);
        assert!(out.labels.iter().all(|&l| l == 1));
        let snapshot = out.hierarchy.last().unwrap();
        assert_eq!(snapshot.nregions, 1);
        assert_eq!(snapshot.regions[0].npix, 16);
    }

    #[test]
    fn two_tone_image_keeps_its_tones() {
        let raster = Raster::single_band(
            Dims::new_2d(4, 2),
            vec![1.0, 1.0, 5.0, 5.0, 1.0, 1.0, 5.0, 5.0],
        );
        let config = SegConfig {
            program_mode: ProgramMode::Hswo,
            dissim_crit: DissimCrit::BandSumMse,
            normind: Normalization::PerBand,
            conv_nregions: 2,
            ..SegConfig::default()
        };
        let out = Segmenter::new(config.clone()).segment(&raster).unwrap();

        assert_eq!(out.nregions, 2);
        let snapshot = out.hierarchy.last().unwrap();
        let mut means: Vec<f64> = snapshot
            .regions
            .iter()
            .map(|r| r.means.as_ref().unwrap()[0])
            .collect();
        means.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((means[0] - 1.0).abs() < 1e-6);
        assert!((means[1] - 5.0).abs() < 1e-6);
        assert!(snapshot.regions.iter().all(|r| r.npix == 4));

        // Zero-threshold growth already yields the two tone regions, so
        // this run converges without performing a single merge and the
        // snapshot carries no merge threshold.
        assert_eq!(snapshot.max_threshold, 0.0);

        // The tone-fusion cost that would be recorded if half-tone
        // fragments ever had to merge: two-pixel fragments sit two
        // normalized units apart (population sigma 2), so the MSE merge
        // costs 2.0 under the square-root policy in effect here, 4.0
        // without it.
        let store = PixelStore::new(&raster, &config).unwrap();
        let derived = DerivedParams::derive(&config, store.dims()).unwrap();
        let params = DissimParams::new(&config, &derived, &store, 1);
        let mut fragment1 = RegionClass::new(1, 1, false, false, false);
        fragment1.seed_for_test(2, &[0.5]);
        let mut fragment2 = RegionClass::new(2, 1, false, false, false);
        fragment2.seed_for_test(2, &[2.5]);
        let sqrt_cost = dissim::region_dissim(&fragment1, &fragment2, &params, false);
        assert!((sqrt_cost - 2.0).abs() < 1e-9);
        let mut plain = params.clone();
        plain.mse_sqrt = false;
        let plain_cost = dissim::region_dissim(&fragment1, &fragment2, &plain, false);
        assert!((plain_cost - 4.0).abs() < 1e-9);
    }

    #[test]
    fn two_tone_cross_merge_threshold_matches_kernel() {
        let raster = Raster::single_band(
            Dims::new_2d(4, 2),
            vec![1.0, 1.0, 5.0, 5.0, 1.0, 1.0, 5.0, 5.0],
        );
        let config = SegConfig {
            program_mode: ProgramMode::Hswo,
            dissim_crit: DissimCrit::BandSumMse,
            normind: Normalization::PerBand,
            conv_nregions: 1,
            ..SegConfig::default()
        };
        let out = Segmenter::new(config).segment(&raster).unwrap();

        assert_eq!(out.nregions, 1);
        // Normalized tone gap is 2 (population sigma 2), so the final MSE
        // merge costs sqrt(2^2 * 4*4/(4+4)) = sqrt(8).
        assert!((out.max_threshold - 8.0f64.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn bright_pixel_line_spectral_clustering() {
        init_logs();
        let raster = Raster::single_band(Dims::new_1d(5), vec![0.0, 0.0, 10.0, 0.0, 0.0]);
        let config = SegConfig {
            program_mode: ProgramMode::Hseg,
            dissim_crit: DissimCrit::OneNorm,
            normind: Normalization::None,
            conn_type: 1,
            spclust_wght: 0.5,
            conv_nregions: 1,
            hseg_out_nregions: vec![2],
            ..SegConfig::default()
        };
        let out = Segmenter::new(config).segment(&raster).unwrap();

        let snapshots = out.hierarchy.snapshots();
        assert_eq!(snapshots.len(), 2);

        // At two regions the flanks have fused across the bright pixel.
        let at_two = &snapshots[0];
        assert_eq!(at_two.nregions, 2);
        let labels = &at_two.labels;
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[0], labels[3]);
        assert_eq!(labels[3], labels[4]);
        assert_ne!(labels[0], labels[2]);
        let mut npix: Vec<u32> = at_two.regions.iter().map(|r| r.npix).collect();
        npix.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(npix, vec![4, 1]);

        // Fusing the identical flanks is a zero-dissimilarity spectral
        // clustering merge, so no merge threshold has accrued yet.
        assert_eq!(at_two.max_threshold, 0.0);

        // Absorbing the bright pixel costs its full 1-norm distance.
        let at_one = &snapshots[1];
        assert_eq!(at_one.nregions, 1);
        assert!((at_one.max_threshold - 10.0).abs() < 1e-5);
        assert!(is_refinement(at_two, at_one));
    }

    #[test]
    fn rhseg_seam_artifacts_are_eliminated() {
        init_logs();
        let raster = Raster {
            dims: Dims::new_2d(8, 4),
            nbands: 1,
            bands: vec![3.0; 32],
            mask: None,
            local_std_dev: None,
            edge_value: Some(vec![0.0; 32]),
            edge_mask: None,
            region_map: None,
        };
        let config = SegConfig {
            program_mode: ProgramMode::Rhseg,
            dissim_crit: DissimCrit::TwoNorm,
            normind: Normalization::None,
            rnb_levels: 2,
            min_nregions: 1,
            conv_nregions: 1,
            seam_edge_threshold: 0.05,
            ..SegConfig::default()
        };
        let out = Segmenter::new(config).segment(&raster).unwrap();

        assert_eq!(out.nregions, 1);
        let first = out.labels[0];
        assert!(out.labels.iter().all(|&l| l == first));
        assert_eq!(out.hierarchy.last().unwrap().regions[0].npix, 32);
        // The fusion came from the seam engine, not a merge threshold.
        assert_eq!(out.max_threshold, 0.0);
    }

    #[test]
    fn rhseg_mode_demands_an_edge_image() {
        let raster = Raster::single_band(Dims::new_2d(8, 4), vec![3.0; 32]);
        let config = SegConfig {
            program_mode: ProgramMode::Rhseg,
            rnb_levels: 2,
            min_nregions: 1,
            ..SegConfig::default()
        };
        let err = Segmenter::new(config).segment(&raster).unwrap_err();
        assert!(matches!(
            err,
            SegmentationError::ConfigError { .. }
        ));
    }

    #[test]
    fn edge_suppression_inflates_the_cross_merge_threshold() {
        // Two blocks of values 3 and 4 with a strong edge ridge on their
        // shared boundary.
        let dims = Dims::new_2d(4, 4);
        let mut bands = Vec::with_capacity(16);
        for _row in 0..4 {
            bands.extend_from_slice(&[3.0, 3.0, 4.0, 4.0]);
        }
        let mut edge = vec![0.0f32; 16];
        for row in 0..4 {
            edge[1 + row * 4] = 1.0;
            edge[2 + row * 4] = 1.0;
        }
        let base = SegConfig {
            program_mode: ProgramMode::Hseg,
            dissim_crit: DissimCrit::OneNorm,
            normind: Normalization::None,
            spclust_wght: 0.5,
            conv_nregions: 1,
            edge_wght: 1.0,
            edge_power: 1.0,
            ..SegConfig::default()
        };

        let with_edge = Raster {
            dims,
            nbands: 1,
            bands: bands.clone(),
            mask: None,
            local_std_dev: None,
            edge_value: Some(edge),
            edge_mask: None,
            region_map: None,
        };
        let suppressed = Segmenter::new(base.clone()).segment(&with_edge).unwrap();

        let without_edge = Raster::single_band(dims, bands);
        let plain = Segmenter::new(base).segment(&without_edge).unwrap();

        assert_eq!(suppressed.nregions, 1);
        assert_eq!(plain.nregions, 1);
        // Suppress option doubles the cross-edge dissimilarity at full
        // edge evidence: (w + (1-w))/w with w = 0.5.
        assert!(suppressed.max_threshold > plain.max_threshold * 1.5);
    }

    #[test]
    fn blocks_behind_a_strong_edge_stay_distinct() {
        let dims = Dims::new_2d(4, 4);
        let mut bands = Vec::with_capacity(16);
        for _row in 0..4 {
            bands.extend_from_slice(&[3.0, 3.0, 4.0, 4.0]);
        }
        let mut edge = vec![0.0f32; 16];
        for row in 0..4 {
            edge[1 + row * 4] = 1.0;
            edge[2 + row * 4] = 1.0;
        }
        let raster = Raster {
            dims,
            nbands: 1,
            bands,
            mask: None,
            local_std_dev: None,
            edge_value: Some(edge),
            edge_mask: None,
            region_map: None,
        };
        let config = SegConfig {
            program_mode: ProgramMode::Hseg,
            dissim_crit: DissimCrit::OneNorm,
            normind: Normalization::None,
            spclust_wght: 0.5,
            conv_nregions: 2,
            edge_wght: 1.0,
            ..SegConfig::default()
        };
        let out = Segmenter::new(config).segment(&raster).unwrap();

        // Both blocks survive in every snapshot.
        assert_eq!(out.nregions, 2);
        for snapshot in out.hierarchy.snapshots() {
            assert_eq!(snapshot.nregions, 2);
            let mut means: Vec<f64> = snapshot
                .regions
                .iter()
                .map(|r| r.means.as_ref().unwrap()[0])
                .collect();
            means.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert!((means[0] - 3.0).abs() < 1e-6);
            assert!((means[1] - 4.0).abs() < 1e-6);
        }
    }

    #[test]
    fn threshold_triggers_emit_on_crossings() {
        let raster = Raster::single_band(Dims::new_1d(6), vec![0.0, 0.0, 1.0, 1.0, 4.0, 4.0]);
        let config = SegConfig {
            program_mode: ProgramMode::Hswo,
            dissim_crit: DissimCrit::OneNorm,
            normind: Normalization::None,
            conn_type: 1,
            conv_nregions: 1,
            hseg_out_thresholds: vec![0.5, 2.0],
            ..SegConfig::default()
        };
        let out = Segmenter::new(config).segment(&raster).unwrap();

        // Merges happen at 1.0 (crossing 0.5) and 3.5 (crossing 2.0).
        let snapshots = out.hierarchy.snapshots();
        assert!(snapshots.len() >= 2);
        for pair in snapshots.windows(2) {
            assert!(pair[1].nregions < pair[0].nregions);
            assert!(pair[1].max_threshold >= pair[0].max_threshold);
            assert!(is_refinement(&pair[0], &pair[1]));
        }
        assert_eq!(snapshots.last().unwrap().nregions, 1);
    }

    #[test]
    fn chk_nregions_streams_levels_to_convergence() {
        let raster =
            Raster::single_band(Dims::new_1d(8), vec![0.0, 0.0, 1.0, 1.0, 3.0, 3.0, 7.0, 7.0]);
        let config = SegConfig {
            program_mode: ProgramMode::Hswo,
            dissim_crit: DissimCrit::OneNorm,
            normind: Normalization::None,
            conn_type: 1,
            conv_nregions: 1,
            chk_nregions: Some(4),
            ..SegConfig::default()
        };
        let out = Segmenter::new(config).segment(&raster).unwrap();

        let snapshots = out.hierarchy.snapshots();
        assert_eq!(snapshots[0].nregions, 4);
        assert_eq!(snapshots.last().unwrap().nregions, 1);
        for pair in snapshots.windows(2) {
            assert!(pair[1].nregions < pair[0].nregions);
            assert!(is_refinement(&pair[0], &pair[1]));
        }
    }
}
