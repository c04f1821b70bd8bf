//! First-merge region growing
//!
//! Seeded fast initial pass: each unlabeled good pixel starts a region that
//! greedily absorbs frontier pixels whose pixel-to-region dissimilarity
//! stays at or below the initial threshold. With a zero threshold this
//! partitions the window into maximal connected runs of identical pixels.

use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{DerivedParams, SegConfig};
use crate::connectivity::{find_neighbor, pixel_coords};
use crate::dissim::{self, DissimParams};
use crate::error::SegResult;
use crate::pixel::{PixelStore, WindowBounds};
use crate::region::RegionClass;

/// Fixed shuffle seed used when `random_init_seed_flag` is off
const FIRST_MERGE_SEED: u64 = 42;

/// Grow zero-threshold (or `init_threshold`-gated) regions over every
/// unlabeled good pixel in `window`, appending fresh regions to the table.
/// Returns the number of regions created.
pub fn first_merge_region_grow(
    store: &mut PixelStore,
    window: &WindowBounds,
    config: &SegConfig,
    derived: &DerivedParams,
    params: &DissimParams,
    regions: &mut Vec<RegionClass>,
    next_label: &mut u32,
) -> SegResult<u32> {
    let mut rng = if config.random_init_seed_flag {
        ChaCha8Rng::from_entropy()
    } else {
        ChaCha8Rng::seed_from_u64(FIRST_MERGE_SEED)
    };

    let dims = *store.dims();
    let init_threshold = config.init_threshold as f64;
    let mut created = 0u32;

    let seeds: Vec<usize> = window.pixels(&dims).collect();
    for seed in seeds {
        if !store.mask(seed) || store.region_label(seed) != 0 {
            continue;
        }

        let label = *next_label;
        *next_label += 1;
        while regions.len() < label as usize {
            let fill_label = regions.len() as u32 + 1;
            regions.push(new_region(fill_label, store, derived));
        }
        created += 1;

        let region_index = (label - 1) as usize;
        regions[region_index].clear();
        regions[region_index].add_pixel(store, seed);
        store.set_region_label(seed, label);
        store.set_init_flag(seed, true);

        let mut pending: BTreeSet<usize> = BTreeSet::new();
        push_frontier(store, window, derived, seed, &mut pending);

        // Absorb one qualifying frontier pixel at a time until none remains.
        loop {
            let mut candidates: Vec<usize> = pending.iter().copied().collect();
            if init_threshold > 0.0 {
                candidates.shuffle(&mut rng);
            }

            let mut grew = false;
            for candidate in candidates {
                if !store.mask(candidate)
                    || store.region_label(candidate) != 0
                    || store.init_flag(candidate)
                {
                    pending.remove(&candidate);
                    continue;
                }
                let dissim = dissim::region_pixel_dissim(
                    &regions[region_index],
                    store,
                    candidate,
                    params,
                );
                if dissim <= init_threshold {
                    pending.remove(&candidate);
                    regions[region_index].add_pixel(store, candidate);
                    store.set_region_label(candidate, label);
                    store.set_init_flag(candidate, true);
                    push_frontier(store, window, derived, candidate, &mut pending);
                    grew = true;
                    break;
                } else {
                    // Out of reach for this region, permanently.
                    pending.remove(&candidate);
                }
            }
            if !grew {
                break;
            }
        }
    }

    // Large survivors get special treatment in later edge modulation.
    if config.initial_merge_npix > 0 {
        for region in regions.iter_mut() {
            if region.active() && region.npix() >= config.initial_merge_npix {
                region.initial_merge_flag = true;
            }
        }
    }

    log::debug!(
        "first merge grew {} regions over {} window pixels",
        created,
        window.npixels()
    );
    Ok(created)
}

fn new_region(label: u32, store: &PixelStore, derived: &DerivedParams) -> RegionClass {
    RegionClass::new(
        label,
        store.nbands(),
        derived.region_sumsq_flag,
        derived.region_sumxlogx_flag,
        store.has_local_std_dev(),
    )
}

/// Queue the unlabeled good neighbors of `pixel` that lie inside the window.
fn push_frontier(
    store: &PixelStore,
    window: &WindowBounds,
    derived: &DerivedParams,
    pixel: usize,
    pending: &mut BTreeSet<usize>,
) {
    let dims = *store.dims();
    let (col, row, slice) = pixel_coords(&dims, pixel);
    for nbdir in 0..derived.maxnbdir {
        if let Some(nghbr) =
            find_neighbor(&dims, derived.nb_dimensions, col, row, slice, nbdir)
        {
            let (ncol, nrow, nslice) = pixel_coords(&dims, nghbr);
            if window.contains(ncol, nrow, nslice)
                && store.mask(nghbr)
                && store.region_label(nghbr) == 0
                && !store.init_flag(nghbr)
            {
                pending.insert(nghbr);
            }
        }
    }
}

/// Rebuild every windowed region's statistics from the current label map.
pub fn region_classes_init(
    store: &PixelStore,
    window: &WindowBounds,
    derived: &DerivedParams,
    regions: &mut Vec<RegionClass>,
) -> u32 {
    let dims = *store.dims();
    let mut max_label = 0u32;

    let mut seen: BTreeSet<u32> = BTreeSet::new();
    for pixel in window.pixels(&dims) {
        let label = store.region_label(pixel);
        if label == 0 {
            continue;
        }
        while regions.len() < label as usize {
            let fill_label = regions.len() as u32 + 1;
            regions.push(new_region(fill_label, store, derived));
        }
        if seen.insert(label) {
            regions[(label - 1) as usize].clear();
        }
        regions[(label - 1) as usize].add_pixel(store, pixel);
        if label > max_label {
            max_label = label;
        }
    }
    max_label
}

/// Build region-level neighbor sets from the label map; adjacency follows
/// the configured connectivity and is clipped to the window.
pub fn neighbor_sets_init(
    store: &PixelStore,
    window: &WindowBounds,
    derived: &DerivedParams,
    regions: &mut [RegionClass],
) {
    let dims = *store.dims();
    for pixel in window.pixels(&dims) {
        let label = store.region_label(pixel);
        if label != 0 {
            regions[(label - 1) as usize].nghbrs.clear();
        }
    }
    for pixel in window.pixels(&dims) {
        let label = store.region_label(pixel);
        if label == 0 || !store.mask(pixel) {
            continue;
        }
        let (col, row, slice) = pixel_coords(&dims, pixel);
        for nbdir in 0..derived.maxnbdir {
            if let Some(nghbr) =
                find_neighbor(&dims, derived.nb_dimensions, col, row, slice, nbdir)
            {
                let (ncol, nrow, nslice) = pixel_coords(&dims, nghbr);
                if !window.contains(ncol, nrow, nslice) || !store.mask(nghbr) {
                    continue;
                }
                let other = store.region_label(nghbr);
                if other != 0 && other != label {
                    regions[(label - 1) as usize].nghbrs.insert(other);
                }
            }
        }
    }
}
