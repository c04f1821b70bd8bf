//! The hierarchical merge engine
//!
//! Hybrid of step-wise optimal region growing (neighbor merges) and
//! spectral clustering (region merges), driven by the two heaps. One call
//! to [`merge_stage`] runs a batch of merges up to the current adaptive
//! threshold; [`run_to_target`] repeats stages until the region count
//! reaches the converge target.

use std::collections::BTreeSet;

use crate::config::SegConfig;
use crate::dissim::{self, DissimParams};
use crate::heap::{DissimHeap, HeapChannel};
use crate::region::RegionClass;

/// Self-correction events, visible to the test suite
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrectionCounters {
    /// Inactive regions found (and removed) at a heap top
    pub inactive_heap_top: u64,
    /// Heap tops whose tied best set had gone entirely stale
    pub stale_best_recovered: u64,
    /// Full heap rebuilds forced by a stalled stage
    pub heap_rebuilds: u64,
}

/// Region table, heaps and merge progress for one processing window
#[derive(Debug)]
pub struct MergeState {
    pub regions: Vec<RegionClass>,
    pub nghbr_heap: DissimHeap,
    pub region_heap: DissimHeap,
    /// Active regions inside the current scope (processing window)
    pub nregions: u32,
    pub max_threshold: f64,
    pub min_npixels: u32,
    pub corrections: CorrectionCounters,
    /// Labels the heaps were last built over; rebuilds stay inside it
    scope: Vec<u32>,
}

impl MergeState {
    pub fn new(regions: Vec<RegionClass>) -> Self {
        let nregions = regions.iter().filter(|r| r.active()).count() as u32;
        Self {
            regions,
            nghbr_heap: DissimHeap::new(HeapChannel::Nghbr),
            region_heap: DissimHeap::new(HeapChannel::Region),
            nregions,
            max_threshold: 0.0,
            min_npixels: 1,
            corrections: CorrectionCounters::default(),
            scope: Vec::new(),
        }
    }

    pub fn active_labels(&self) -> Vec<u32> {
        self.regions
            .iter()
            .filter(|r| r.active())
            .map(|r| r.label())
            .collect()
    }
}

/// Pick the spectral-clustering eligibility floor over the given labels: at
/// least the configured minimum, raised until no more than `spclust_max`
/// regions qualify, but relaxed while fewer than `spclust_min` do.
pub fn choose_min_npixels(regions: &[RegionClass], labels: &[u32], config: &SegConfig) -> u32 {
    let floor = config.min_npixels.max(1);
    let mut sizes: Vec<u32> = labels
        .iter()
        .map(|&l| &regions[(l - 1) as usize])
        .filter(|r| r.active())
        .map(|r| r.npix())
        .collect();
    if sizes.len() <= config.spclust_max as usize {
        return floor;
    }
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    let count_at = |min_np: u32| sizes.iter().filter(|&&s| s >= min_np).count() as u32;
    let mut min_npixels = sizes[(config.spclust_max - 1) as usize];
    if count_at(min_npixels) > config.spclust_max {
        min_npixels += 1;
    }
    while min_npixels > floor && count_at(min_npixels) < config.spclust_min {
        min_npixels -= 1;
    }
    min_npixels.max(floor)
}

/// Build both heaps over every active region.
pub fn init_heaps(state: &mut MergeState, config: &SegConfig, params: &mut DissimParams) {
    let labels = state.active_labels();
    init_heaps_for(state, config, params, labels);
}

/// Build both heaps over the given window's regions. Adapts `min_npixels`
/// through `params` so the dissimilarity kernel and the eligibility rule
/// stay in agreement.
pub fn init_heaps_for(
    state: &mut MergeState,
    config: &SegConfig,
    params: &mut DissimParams,
    labels: Vec<u32>,
) {
    let labels: Vec<u32> = labels
        .into_iter()
        .filter(|&l| state.regions[(l - 1) as usize].active())
        .collect();
    params.min_npixels = choose_min_npixels(&state.regions, &labels, config);
    state.min_npixels = params.min_npixels;
    state.nregions = labels.len() as u32;
    state.scope = labels.clone();

    for &label in &labels {
        state.regions[(label - 1) as usize].clear_best_nghbr();
        RegionClass::recompute_best_neighbor(&mut state.regions, label, params);
    }
    state.nghbr_heap.clear(&mut state.regions);
    state.nghbr_heap.assign(&mut state.regions, labels.clone());

    state.region_heap.clear(&mut state.regions);
    if params.spclust_wght > 0.0 {
        let eligible: Vec<u32> = labels
            .into_iter()
            .filter(|&l| state.regions[(l - 1) as usize].npix() >= state.min_npixels)
            .collect();
        best_region_init(&mut state.regions, &eligible, params);
        state.region_heap.assign(&mut state.regions, eligible);
    }

    log::debug!(
        "heaps initialized: {} neighbor entries, {} region entries, min_npixels = {}",
        state.nghbr_heap.len(),
        state.region_heap.len(),
        state.min_npixels
    );
}

/// Triangular initialization of the best-region records: each pair is
/// evaluated once and offered to both sides, because the non-spatial best
/// partner is not derivable from any neighbor set.
fn best_region_init(regions: &mut Vec<RegionClass>, eligible: &[u32], params: &DissimParams) {
    for &label in eligible {
        regions[(label - 1) as usize].clear_best_region();
    }
    for (i, &label) in eligible.iter().enumerate() {
        for &other in &eligible[i + 1..] {
            let dissim = dissim::region_channel_dissim(
                &regions[(label - 1) as usize],
                &regions[(other - 1) as usize],
                params,
            );
            offer_best_region(&mut regions[(label - 1) as usize], other, dissim);
            offer_best_region(&mut regions[(other - 1) as usize], label, dissim);
        }
    }
}

fn offer_best_region(region: &mut RegionClass, other: u32, dissim: f32) -> bool {
    if dissim < region.best_region_dissim {
        region.best_region_labels.clear();
        region.best_region_labels.insert(other);
        region.best_region_dissim = dissim;
        true
    } else if dissim == region.best_region_dissim {
        region.best_region_labels.insert(other)
    } else {
        false
    }
}

/// Pop inactive entries off the heap top until an active region surfaces.
fn active_top(
    heap: &mut DissimHeap,
    regions: &mut [RegionClass],
    corrections: &mut CorrectionCounters,
) -> Option<u32> {
    while let Some(top) = heap.top() {
        if regions[(top - 1) as usize].active() {
            return Some(top);
        }
        log::warn!("found inactive region {} at top of heap", top);
        corrections.inactive_heap_top += 1;
        heap.remove_at(regions, 0);
    }
    None
}

/// The absorber is the larger-npix region, breaking ties toward the smaller
/// label. Returns (absorber, absorbed).
fn order_pair(regions: &[RegionClass], top: u32, partner: u32) -> (u32, u32) {
    let t = &regions[(top - 1) as usize];
    let p = &regions[(partner - 1) as usize];
    if p.npix() > t.npix() || (p.npix() == t.npix() && p.label() < t.label()) {
        (partner, top)
    } else {
        (top, partner)
    }
}

/// Bookkeeping sets accumulated across a micro-batch of merges
#[derive(Default)]
struct UpdateSets {
    nghbrs: BTreeSet<u32>,
    regions: BTreeSet<u32>,
    added: BTreeSet<u32>,
    removed: BTreeSet<u32>,
}

impl UpdateSets {
    fn region_sets_empty(&self) -> bool {
        self.regions.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Run one stage of merges. Returns true when the stage ended early because
/// a large-large neighbor merge asked the outer loop to re-examine
/// convergence.
pub fn merge_stage(
    state: &mut MergeState,
    last_stage: bool,
    converge_nregions: u32,
    params: &DissimParams,
) -> bool {
    let mut sets = UpdateSets::default();

    if !state.nghbr_heap.is_empty() && state.region_heap.len() < 2 {
        let Some(top) = active_top(&mut state.nghbr_heap, &mut state.regions, &mut state.corrections)
        else {
            return false;
        };
        let nghbr_thresh = state.regions[(top - 1) as usize].best_nghbr_dissim() as f64;
        let new_max_threshold = state.max_threshold.max(nghbr_thresh);
        if nghbr_thresh < f32::MAX as f64 {
            let early = neighbor_merge_loop(
                state,
                last_stage,
                converge_nregions,
                new_max_threshold,
                params,
                &mut sets,
            );
            if early {
                return true;
            }
            if (state.region_heap.len() > 0 || !sets.added.is_empty())
                && !sets.region_sets_empty()
            {
                update_regions(state, &mut sets, params);
            }
        }
        return false;
    }

    if !state.nghbr_heap.is_empty() && state.region_heap.len() > 1 {
        let mut process_flag = true;
        let mut nghbr_thresh = state.max_threshold;
        let mut new_max_threshold = nghbr_thresh;

        let Some(top) = active_top(&mut state.region_heap, &mut state.regions, &mut state.corrections)
        else {
            return false;
        };
        let spclust_thresh = state.regions[(top - 1) as usize].best_region_dissim() as f64;
        if spclust_thresh >= new_max_threshold * params.spclust_wght && spclust_thresh != 0.0 {
            process_flag = false;
        }
        if !process_flag {
            let Some(top) =
                active_top(&mut state.nghbr_heap, &mut state.regions, &mut state.corrections)
            else {
                return false;
            };
            nghbr_thresh = state.regions[(top - 1) as usize].best_nghbr_dissim() as f64;
            new_max_threshold = state.max_threshold.max(nghbr_thresh);
        }

        if nghbr_thresh > 0.0 || process_flag {
            if spclust_merge_loop(state, last_stage, converge_nregions, new_max_threshold, params, &mut sets)
            {
                return true;
            }
            if !sets.nghbrs.is_empty() && state.nregions > converge_nregions {
                update_nghbrs(state, &mut sets.nghbrs, params);
            }
            sets.nghbrs.clear();

            // Now go to neighbor merges, keeping the stage threshold.
            if let Some(top) =
                active_top(&mut state.nghbr_heap, &mut state.regions, &mut state.corrections)
            {
                let nghbr_thresh = state.regions[(top - 1) as usize].best_nghbr_dissim() as f64;
                if nghbr_thresh < f32::MAX as f64 {
                    let early = neighbor_merge_loop(
                        state,
                        last_stage,
                        converge_nregions,
                        new_max_threshold,
                        params,
                        &mut sets,
                    );
                    if early {
                        return true;
                    }
                    if (state.region_heap.len() > 0 || !sets.added.is_empty())
                        && !sets.region_sets_empty()
                    {
                        update_regions(state, &mut sets, params);
                    }
                }
            }
        }
        return false;
    }

    log::warn!("merge stage reached with no mergeable heap state");
    false
}

/// Merge all spatially adjacent pairs whose dissimilarity stays at or below
/// the stage threshold (zero-dissimilarity pairs always merge).
fn neighbor_merge_loop(
    state: &mut MergeState,
    last_stage: bool,
    converge_nregions: u32,
    new_max_threshold: f64,
    params: &DissimParams,
    sets: &mut UpdateSets,
) -> bool {
    let Some(mut top) = active_top(&mut state.nghbr_heap, &mut state.regions, &mut state.corrections)
    else {
        return false;
    };
    let mut nghbr_thresh = state.regions[(top - 1) as usize].best_nghbr_dissim() as f64;

    while (nghbr_thresh <= new_max_threshold && state.nregions > converge_nregions)
        || nghbr_thresh == 0.0
    {
        let threshold = nghbr_thresh;
        let partner = RegionClass::pick_best_neighbor(&state.regions, top);

        if partner == 0 {
            // Every tied best label went inactive between heap updates:
            // drop the top, refresh its record and re-examine.
            log::warn!("region {}: stale best-neighbor set recovered", top);
            state.corrections.stale_best_recovered += 1;
            state.nghbr_heap.remove_label(&mut state.regions, top);
            RegionClass::recompute_best_neighbor(&mut state.regions, top, params);
            state.nghbr_heap.insert(&mut state.regions, top);
        } else {
            let (absorber, absorbed) = order_pair(&state.regions, top, partner);
            if absorber != top {
                // Heap snapshots lag behind live npix; surface the absorber
                // so the heap order matches the merge about to happen.
                state.nghbr_heap.bring_to_top(&mut state.regions, absorber);
            }

            if last_stage
                && state.regions[(absorber - 1) as usize].npix() >= state.min_npixels
                && state.regions[(absorbed - 1) as usize].npix() >= state.min_npixels
            {
                if state.regions[(absorber - 1) as usize].large_nghbr_merged_flag()
                    || state.regions[(absorbed - 1) as usize].large_nghbr_merged_flag()
                {
                    if !sets.region_sets_empty() {
                        update_regions(state, sets, params);
                    }
                    return true;
                }
                state.regions[(absorber - 1) as usize].large_nghbr_merged_flag = true;
            }

            merge_bookkeeping(state, absorber, absorbed, threshold, params, sets);
            state.max_threshold = new_max_threshold;
            state.nregions -= 1;
        }

        update_nghbrs(state, &mut sets.nghbrs, params);

        let Some(next_top) =
            active_top(&mut state.nghbr_heap, &mut state.regions, &mut state.corrections)
        else {
            return false;
        };
        top = next_top;
        nghbr_thresh = state.regions[(top - 1) as usize].best_nghbr_dissim() as f64;
    }
    false
}

/// Merge region pairs (not necessarily adjacent) while the spectral
/// clustering threshold allows. Returns true on a large-large early return.
fn spclust_merge_loop(
    state: &mut MergeState,
    last_stage: bool,
    converge_nregions: u32,
    new_max_threshold: f64,
    params: &DissimParams,
    sets: &mut UpdateSets,
) -> bool {
    let Some(mut top) = active_top(&mut state.region_heap, &mut state.regions, &mut state.corrections)
    else {
        return false;
    };
    let mut spclust_thresh = state.regions[(top - 1) as usize].best_region_dissim() as f64;

    while (spclust_thresh < new_max_threshold * params.spclust_wght
        && state.nregions > converge_nregions)
        || spclust_thresh == 0.0
    {
        let threshold = spclust_thresh;
        let partner = RegionClass::pick_best_region(&state.regions, top);

        if partner == 0 {
            log::warn!("region {}: stale best-region set recovered", top);
            state.corrections.stale_best_recovered += 1;
            state.region_heap.remove_label(&mut state.regions, top);
            recompute_best_region_over_heap(state, top, params);
            state.region_heap.insert(&mut state.regions, top);
        } else {
            let (absorber, absorbed) = order_pair(&state.regions, top, partner);
            if absorber != top {
                state.region_heap.bring_to_top(&mut state.regions, absorber);
            }

            if last_stage
                && state.regions[(absorber - 1) as usize].npix() >= state.min_npixels
                && state.regions[(absorbed - 1) as usize].npix() >= state.min_npixels
                && state.regions[(absorber - 1) as usize].is_neighbor(absorbed)
            {
                if state.regions[(absorber - 1) as usize].large_nghbr_merged_flag()
                    || state.regions[(absorbed - 1) as usize].large_nghbr_merged_flag()
                {
                    if !sets.nghbrs.is_empty() {
                        update_nghbrs(state, &mut sets.nghbrs, params);
                    }
                    return true;
                }
                state.regions[(absorber - 1) as usize].large_nghbr_merged_flag = true;
            }

            merge_bookkeeping(state, absorber, absorbed, threshold, params, sets);
            // A spectral cluster merge raises the running threshold by its
            // weighted equivalent.
            let weighted = spclust_thresh / params.spclust_wght;
            if state.max_threshold < weighted {
                state.max_threshold = weighted;
            }
            state.nregions -= 1;
        }

        update_regions(state, sets, params);

        let Some(next_top) =
            active_top(&mut state.region_heap, &mut state.regions, &mut state.corrections)
        else {
            return false;
        };
        top = next_top;
        spclust_thresh = state.regions[(top - 1) as usize].best_region_dissim() as f64;
        if state.region_heap.len() < 2 {
            break;
        }
    }
    false
}

/// Heap membership and update-set bookkeeping shared by both merge flavors,
/// ending in the actual statistics merge.
fn merge_bookkeeping(
    state: &mut MergeState,
    absorber: u32,
    absorbed: u32,
    threshold: f64,
    params: &DissimParams,
    sets: &mut UpdateSets,
) {
    state.nghbr_heap.remove_label(&mut state.regions, absorbed);

    sets.nghbrs.insert(absorber);
    sets.nghbrs.remove(&absorbed);

    if params.spclust_wght > 0.0 {
        let absorber_npix = state.regions[(absorber - 1) as usize].npix();
        let absorbed_npix = state.regions[(absorbed - 1) as usize].npix();
        if absorber_npix + absorbed_npix >= state.min_npixels {
            if absorber_npix < state.min_npixels {
                sets.added.insert(absorber);
            } else {
                sets.regions.insert(absorber);
            }
        }
        if absorbed_npix >= state.min_npixels {
            state.region_heap.remove_label(&mut state.regions, absorbed);
            sets.removed.insert(absorbed);
            sets.regions.remove(&absorbed);
            sets.added.remove(&absorbed);
        }
    }

    RegionClass::merge_pair(&mut state.regions, absorber, absorbed, threshold);
}

/// Recompute best-neighbor records for every region in the set, then visit
/// their neighborhoods: a neighbor whose best set named the touched region
/// is recomputed in full, everyone else just gets the fresh pairing offered.
pub(crate) fn update_nghbrs(
    state: &mut MergeState,
    set: &mut BTreeSet<u32>,
    params: &DissimParams,
) {
    let touched: Vec<u32> = set.iter().copied().collect();
    set.clear();
    for label in touched {
        if !state.regions[(label - 1) as usize].active() {
            continue;
        }
        state.regions[(label - 1) as usize].clear_best_nghbr();
        RegionClass::recompute_best_neighbor(&mut state.regions, label, params);
        if state.nghbr_heap.contains(&state.regions, label) {
            state.nghbr_heap.update(&mut state.regions, label);
        } else {
            state.nghbr_heap.insert(&mut state.regions, label);
        }

        let nghbr_labels: Vec<u32> =
            state.regions[(label - 1) as usize].nghbrs().iter().copied().collect();
        for nghbr in nghbr_labels {
            if !state.regions[(nghbr - 1) as usize].active() {
                continue;
            }
            if state.regions[(nghbr - 1) as usize].is_best_neighbor(label) {
                // Its previous best partner just changed shape.
                state.regions[(nghbr - 1) as usize].clear_best_nghbr();
                RegionClass::recompute_best_neighbor(&mut state.regions, nghbr, params);
            } else {
                RegionClass::update_best_neighbor(&mut state.regions, nghbr, label, params);
            }
            state.nghbr_heap.update(&mut state.regions, nghbr);
        }
        state.regions[(label - 1) as usize].merged_flag = false;
    }
}

/// Apply the accumulated region-heap membership changes: drop the removed,
/// rescan the updated, and admit the newly eligible.
fn update_regions(state: &mut MergeState, sets: &mut UpdateSets, params: &DissimParams) {
    for &label in &sets.removed {
        state.regions[(label - 1) as usize].clear_best_region();
    }
    let affected: Vec<u32> = sets.regions.union(&sets.added).copied().collect();
    sets.regions.clear();
    sets.added.clear();
    sets.removed.clear();

    for label in affected {
        if !state.regions[(label - 1) as usize].active()
            || state.regions[(label - 1) as usize].npix() < state.min_npixels
        {
            continue;
        }
        recompute_best_region_over_heap(state, label, params);
        if state.region_heap.contains(&state.regions, label) {
            state.region_heap.update(&mut state.regions, label);
        } else {
            state.region_heap.insert(&mut state.regions, label);
        }
    }
}

/// Full symmetric rescan of one region against every heap member.
fn recompute_best_region_over_heap(state: &mut MergeState, label: u32, params: &DissimParams) {
    state.regions[(label - 1) as usize].clear_best_region();
    for index in 0..state.region_heap.len() {
        let other = state.region_heap.label_at(index);
        if other == label || !state.regions[(other - 1) as usize].active() {
            continue;
        }
        let dissim = dissim::region_channel_dissim(
            &state.regions[(label - 1) as usize],
            &state.regions[(other - 1) as usize],
            params,
        );
        offer_best_region(&mut state.regions[(label - 1) as usize], other, dissim);
        if offer_best_region(&mut state.regions[(other - 1) as usize], label, dissim) {
            state.region_heap.update(&mut state.regions, other);
        }
    }
}

/// Run one stage of merges toward `target`, resetting the large-merge
/// flags first and rebuilding the heaps once if the stage stalls with work
/// remaining. Returns true when the region count moved.
pub fn merge_step(
    state: &mut MergeState,
    config: &SegConfig,
    params: &mut DissimParams,
    target: u32,
    last_stage: bool,
) -> bool {
    if state.nregions <= target {
        return false;
    }
    if state.nghbr_heap.is_empty() && state.region_heap.len() < 2 {
        return false;
    }
    for region in &mut state.regions {
        region.large_nghbr_merged_flag = false;
    }
    let before = state.nregions;
    merge_stage(state, last_stage, target, params);
    if state.nregions == before {
        // Nothing moved: either every top is at +inf or the heaps went
        // stale; one rebuild gets a second opinion before giving up.
        log::warn!(
            "merge stage stalled at {} regions (target {}); rebuilding heaps",
            state.nregions,
            target
        );
        state.corrections.heap_rebuilds += 1;
        let scope = state.scope.clone();
        init_heaps_for(state, config, params, scope);
        merge_stage(state, last_stage, target, params);
    }
    state.nregions < before
}

/// Repeat merge stages until the region count reaches `target`.
pub fn run_to_target(
    state: &mut MergeState,
    config: &SegConfig,
    params: &mut DissimParams,
    target: u32,
    last_stage: bool,
) {
    while merge_step(state, config, params, target, last_stage) {}
}
