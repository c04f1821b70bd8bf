//! Processing-window seam artifact elimination
//!
//! Where a window boundary split what should have been one region, the
//! seam band carries low edge evidence and the pair is merged back; where a
//! real image edge sits on the boundary, the mean seam edge value exceeds
//! the gate and the split survives.

use crate::config::{DerivedParams, MIN_SEAM_EDGE_NPIX};
use crate::connectivity::{find_neighbor, is_direct_across, pixel_coords, SplitAxis};
use crate::heap::{DissimHeap, HeapChannel};
use crate::merge::MergeState;
use crate::pixel::{PixelStore, WindowBounds};
use crate::region::{RegionClass, RegionSeam};

/// One window boundary inside the reassembled frame: the split axis and the
/// first coordinate of the upper half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeamSpec {
    pub axis: SplitAxis,
    pub position: usize,
}

/// Sample the seam bands and build the seam-region table.
///
/// A pixel contributes `RegionSeam { 1, edge }` iff exactly one foreign
/// region label appears among its across-seam neighbors and its directly
/// across neighbor carries that label. Contributions land in the pixel's
/// own region's map under the foreign label, so `npix` counts seam pixels
/// sampled on one side.
pub fn seam_region_classes_init(
    store: &PixelStore,
    window: &WindowBounds,
    seams: &[SeamSpec],
    derived: &DerivedParams,
    regions: &mut [RegionClass],
) -> Vec<RegionClass> {
    let dims = *store.dims();
    let mut seam_regions: Vec<RegionClass> = regions
        .iter()
        .map(|r| {
            let mut seam = RegionClass::new(r.label(), 0, false, false, false);
            seam.npix = r.npix();
            seam
        })
        .collect();

    for seam in seams {
        let band = seam_band(window, seam, derived.seam_size);
        for pixel in band.pixels(&dims) {
            if !store.mask(pixel) {
                continue;
            }
            let label = store.region_label(pixel);
            if label == 0 {
                continue;
            }
            regions[(label - 1) as usize].seam_flag = true;

            let (col, row, slice) = pixel_coords(&dims, pixel);
            let this_side = side_of(seam, col, row, slice);

            let mut foreign_label = 0u32;
            let mut unambiguous = true;
            let mut direct_label = 0u32;
            for nbdir in 0..derived.maxnbdir {
                let Some(nghbr) =
                    find_neighbor(&dims, derived.nb_dimensions, col, row, slice, nbdir)
                else {
                    continue;
                };
                let (ncol, nrow, nslice) = pixel_coords(&dims, nghbr);
                if !window.contains(ncol, nrow, nslice)
                    || !store.mask(nghbr)
                    || side_of(seam, ncol, nrow, nslice) == this_side
                {
                    continue;
                }
                let other = store.region_label(nghbr);
                if other == 0 || other == label {
                    continue;
                }
                if foreign_label == 0 {
                    foreign_label = other;
                } else if foreign_label != other {
                    unambiguous = false;
                }
                if is_direct_across(derived.nb_dimensions, nbdir, seam.axis) {
                    direct_label = other;
                }
            }

            if unambiguous && foreign_label != 0 && direct_label == foreign_label {
                let contribution = RegionSeam::new(1, store.edge_value(pixel));
                seam_regions[(label - 1) as usize]
                    .seam_nghbrs
                    .entry(foreign_label)
                    .and_modify(|s| s.accumulate(&contribution))
                    .or_insert(contribution);
            }
        }
    }

    for seam_region in &mut seam_regions {
        if !seam_region.seam_nghbrs.is_empty() {
            seam_region.active = true;
        }
    }
    seam_regions
}

fn seam_band(window: &WindowBounds, seam: &SeamSpec, seam_size: usize) -> WindowBounds {
    let mut band = *window;
    match seam.axis {
        SplitAxis::Col => {
            band.col0 = window.col0.max(seam.position.saturating_sub(seam_size));
            band.col1 = window.col1.min(seam.position + seam_size);
        }
        SplitAxis::Row => {
            band.row0 = window.row0.max(seam.position.saturating_sub(seam_size));
            band.row1 = window.row1.min(seam.position + seam_size);
        }
        SplitAxis::Slice => {
            band.slice0 = window.slice0.max(seam.position.saturating_sub(seam_size));
            band.slice1 = window.slice1.min(seam.position + seam_size);
        }
    }
    band
}

fn side_of(seam: &SeamSpec, col: usize, row: usize, slice: usize) -> bool {
    match seam.axis {
        SplitAxis::Col => col < seam.position,
        SplitAxis::Row => row < seam.position,
        SplitAxis::Slice => slice < seam.position,
    }
}

/// Refresh one seam region's best record: the minimum mean seam edge over
/// its sufficiently sampled pairs.
fn recompute_best_seam(seam_regions: &mut [RegionClass], label: u32) {
    let idx = (label - 1) as usize;
    let mut best_dissim = f32::MAX;
    let mut best_labels = std::collections::BTreeSet::new();
    for (&other, seam) in &seam_regions[idx].seam_nghbrs {
        if seam.npix < MIN_SEAM_EDGE_NPIX {
            continue;
        }
        if !seam_regions[(other - 1) as usize].active {
            continue;
        }
        let mean = seam.mean_edge();
        if mean < best_dissim {
            best_labels.clear();
            best_labels.insert(other);
            best_dissim = mean;
        } else if mean == best_dissim {
            best_labels.insert(other);
        }
    }
    let region = &mut seam_regions[idx];
    region.best_nghbr_labels = best_labels;
    region.best_nghbr_dissim = best_dissim;
}

/// Run the edge-gated seam merge loop. Each merge is mirrored on the seam
/// graph and on the underlying region-class graph; pixel labels are
/// resolved later through the merge chains, and the caller rebuilds the
/// main heaps before the merge engine resumes. Returns the number of
/// merges.
pub fn merge_seam_regions(
    state: &mut MergeState,
    seam_regions: &mut [RegionClass],
    seam_edge_threshold: f32,
) -> u32 {
    let labels: Vec<u32> = seam_regions
        .iter()
        .filter(|r| r.active)
        .map(|r| r.label())
        .collect();
    if labels.is_empty() {
        return 0;
    }
    for &label in &labels {
        recompute_best_seam(seam_regions, label);
    }
    let mut heap = DissimHeap::new(HeapChannel::Nghbr);
    heap.assign(seam_regions, labels);

    let mut merges = 0u32;
    while let Some(top) = heap.top() {
        if !seam_regions[(top - 1) as usize].active {
            heap.remove_at(seam_regions, 0);
            state.corrections.inactive_heap_top += 1;
            continue;
        }
        let threshold = seam_regions[(top - 1) as usize].best_nghbr_dissim;
        if threshold > seam_edge_threshold {
            break;
        }
        let partner = RegionClass::pick_best_neighbor(seam_regions, top);
        if partner == 0 {
            state.corrections.stale_best_recovered += 1;
            heap.remove_label(seam_regions, top);
            recompute_best_seam(seam_regions, top);
            heap.insert(seam_regions, top);
            continue;
        }

        // Absorber ordering mirrors the main engine: larger npix, then
        // smaller label.
        let (absorber, absorbed) = {
            let t = &seam_regions[(top - 1) as usize];
            let p = &seam_regions[(partner - 1) as usize];
            if p.npix() > t.npix() || (p.npix() == t.npix() && p.label() < t.label()) {
                (partner, top)
            } else {
                (top, partner)
            }
        };

        log::debug!(
            "seam merge: region {} into region {} at mean edge {}",
            absorbed,
            absorber,
            threshold
        );
        heap.remove_label(seam_regions, absorbed);
        RegionClass::merge_seam_pair(seam_regions, absorber, absorbed);
        RegionClass::merge_pair(&mut state.regions, absorber, absorbed, threshold as f64);
        state.nregions -= 1;
        merges += 1;

        seam_regions[(absorber - 1) as usize].npix = state.regions[(absorber - 1) as usize].npix();

        // The absorber's map changed, and so did every map that referenced
        // the absorbed label.
        recompute_best_seam(seam_regions, absorber);
        if heap.contains(seam_regions, absorber) {
            heap.update(seam_regions, absorber);
        }
        let affected: Vec<u32> = seam_regions[(absorber - 1) as usize]
            .seam_nghbrs
            .keys()
            .copied()
            .collect();
        for other in affected {
            if seam_regions[(other - 1) as usize].active {
                recompute_best_seam(seam_regions, other);
                if heap.contains(seam_regions, other) {
                    heap.update(seam_regions, other);
                }
            }
        }
    }

    log::info!("seam artifact elimination performed {} merges", merges);
    merges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dims, Normalization, ProgramMode, SegConfig};
    use crate::dissim::DissimCrit;
    use crate::grow;
    use crate::pixel::Raster;

    /// 8x4 frame, both halves uniform value 3, with the given edge image.
    fn split_uniform_fixture(edge: Vec<f32>) -> (PixelStore, SegConfig, DerivedParams) {
        let config = SegConfig {
            dissim_crit: DissimCrit::TwoNorm,
            normind: Normalization::None,
            program_mode: ProgramMode::Rhseg,
            seam_edge_threshold: 0.05,
            ..SegConfig::default()
        };
        let raster = Raster {
            dims: Dims::new_2d(8, 4),
            nbands: 1,
            bands: vec![3.0; 32],
            mask: None,
            local_std_dev: None,
            edge_value: Some(edge),
            edge_mask: None,
            region_map: None,
        };
        let store = PixelStore::new(&raster, &config).unwrap();
        let derived = DerivedParams::derive(&config, store.dims()).unwrap();
        (store, config, derived)
    }

    /// Segment each half independently, then return the joined state.
    fn grow_halves(
        store: &mut PixelStore,
        config: &SegConfig,
        derived: &DerivedParams,
    ) -> MergeState {
        let dims = *store.dims();
        let left = WindowBounds {
            col1: 4,
            ..WindowBounds::full(&dims)
        };
        let right = WindowBounds {
            col0: 4,
            ..WindowBounds::full(&dims)
        };
        let params = crate::dissim::DissimParams::new(config, derived, store, 1);
        let mut regions = Vec::new();
        let mut next_label = 1u32;
        for window in [&left, &right] {
            grow::first_merge_region_grow(
                store, window, config, derived, &params, &mut regions, &mut next_label,
            )
            .unwrap();
        }
        // Rebuild adjacency over the full frame (cross-seam edges appear).
        let full = WindowBounds::full(&dims);
        grow::neighbor_sets_init(store, &full, derived, &mut regions);
        MergeState::new(regions)
    }

    #[test]
    fn clean_seam_contributions_are_direct_and_unambiguous() {
        let (mut store, config, derived) = split_uniform_fixture(vec![0.0; 32]);
        let mut state = grow_halves(&mut store, &config, &derived);
        assert_eq!(state.nregions, 2);

        let full = WindowBounds::full(store.dims());
        let seams = [SeamSpec {
            axis: SplitAxis::Col,
            position: 4,
        }];
        let seam_regions =
            seam_region_classes_init(&store, &full, &seams, &derived, &mut state.regions);

        // Each side samples its four boundary pixels against the other.
        let left = &seam_regions[0];
        let right = &seam_regions[1];
        assert!(left.active && right.active);
        assert_eq!(left.seam_nghbrs[&2].npix, 4);
        assert_eq!(right.seam_nghbrs[&1].npix, 4);
        assert_eq!(left.seam_nghbrs[&2].sum_edge, 0.0);
        assert!(state.regions[0].seam_flag());
        assert!(state.regions[1].seam_flag());
    }

    #[test]
    fn zero_edge_seam_merges_back_to_one_region() {
        let (mut store, config, derived) = split_uniform_fixture(vec![0.0; 32]);
        let mut state = grow_halves(&mut store, &config, &derived);

        let full = WindowBounds::full(store.dims());
        let seams = [SeamSpec {
            axis: SplitAxis::Col,
            position: 4,
        }];
        let mut seam_regions =
            seam_region_classes_init(&store, &full, &seams, &derived, &mut state.regions);

        let merges =
            merge_seam_regions(&mut state, &mut seam_regions, config.seam_edge_threshold);
        assert_eq!(merges, 1);
        assert_eq!(state.nregions, 1);
        let survivor = state.regions.iter().find(|r| r.active()).unwrap();
        assert_eq!(survivor.npix(), 32);
    }

    #[test]
    fn strong_seam_edge_suppresses_the_merge() {
        // Paint a strong edge response along the boundary columns.
        let mut edge = vec![0.0f32; 32];
        for row in 0..4 {
            edge[4 + row * 8] = 1.0;
            edge[3 + row * 8] = 1.0;
        }
        let (mut store, config, derived) = split_uniform_fixture(edge);
        let mut state = grow_halves(&mut store, &config, &derived);

        let full = WindowBounds::full(store.dims());
        let seams = [SeamSpec {
            axis: SplitAxis::Col,
            position: 4,
        }];
        let mut seam_regions =
            seam_region_classes_init(&store, &full, &seams, &derived, &mut state.regions);

        let merges =
            merge_seam_regions(&mut state, &mut seam_regions, config.seam_edge_threshold);
        // Mean seam edge is 1.0, far above the 0.05 gate.
        assert_eq!(merges, 0);
        assert_eq!(state.nregions, 2);
    }

    #[test]
    fn undersampled_pairs_are_ineligible() {
        // A 2-row frame yields only two seam samples per side, below the
        // three-pixel floor.
        let config = SegConfig {
            dissim_crit: DissimCrit::TwoNorm,
            normind: Normalization::None,
            program_mode: ProgramMode::Rhseg,
            ..SegConfig::default()
        };
        let raster = Raster {
            dims: Dims::new_2d(8, 2),
            nbands: 1,
            bands: vec![3.0; 16],
            mask: None,
            local_std_dev: None,
            edge_value: Some(vec![0.0; 16]),
            edge_mask: None,
            region_map: None,
        };
        let mut store = PixelStore::new(&raster, &config).unwrap();
        let derived = DerivedParams::derive(&config, store.dims()).unwrap();
        let mut state = grow_halves(&mut store, &config, &derived);

        let full = WindowBounds::full(store.dims());
        let seams = [SeamSpec {
            axis: SplitAxis::Col,
            position: 4,
        }];
        let mut seam_regions =
            seam_region_classes_init(&store, &full, &seams, &derived, &mut state.regions);
        let merges =
            merge_seam_regions(&mut state, &mut seam_regions, config.seam_edge_threshold);
        assert_eq!(merges, 0);
        assert_eq!(state.nregions, 2);
    }
}
