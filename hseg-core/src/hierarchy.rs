//! Hierarchy snapshots
//!
//! Each trigger freezes the current labeling plus per-region statistics.
//! The emitter is append-only; earlier snapshots are never touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SegConfig;
use crate::merge::MergeState;
use crate::pixel::PixelStore;
use crate::region::RegionClass;

/// Per-region statistics selected by the output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSummary {
    pub label: u32,
    pub npix: u32,
    /// Band means in the input data's original units
    #[serde(skip_serializing_if = "Option::is_none")]
    pub means: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_devs: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub band_max_std_dev: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boundary_npix: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nghbrs: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_objects: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nb_region_objects: Option<u32>,
}

/// One frozen hierarchy level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchySnapshot {
    /// 0-based emission index
    pub level: u32,
    pub nregions: u32,
    pub max_threshold: f64,
    pub emitted_at: DateTime<Utc>,
    /// Region-class label per pixel (0 = unassigned / masked)
    pub labels: Vec<u32>,
    pub regions: Vec<RegionSummary>,
}

/// Append-only snapshot collection forming the engine's output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hierarchy {
    snapshots: Vec<HierarchySnapshot>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> &[HierarchySnapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn last(&self) -> Option<&HierarchySnapshot> {
        self.snapshots.last()
    }

    /// Freeze the current segmentation state as the next level.
    pub fn emit(&mut self, store: &PixelStore, state: &MergeState, config: &SegConfig) {
        let labels: Vec<u32> = store
            .labels()
            .iter()
            .map(|&label| resolve_label(&state.regions, label))
            .collect();

        let mut regions: Vec<RegionSummary> = state
            .regions
            .iter()
            .filter(|r| r.active())
            .map(|r| summarize(r, store, config))
            .collect();
        if config.sort_flag {
            regions.sort_by(|a, b| b.npix.cmp(&a.npix).then(a.label.cmp(&b.label)));
        }

        log::info!(
            "hierarchy level {}: {} regions at max threshold {}",
            self.snapshots.len(),
            state.nregions,
            state.max_threshold
        );
        self.snapshots.push(HierarchySnapshot {
            level: self.snapshots.len() as u32,
            nregions: state.nregions,
            max_threshold: state.max_threshold,
            emitted_at: Utc::now(),
            labels,
            regions,
        });
    }
}

fn summarize(region: &RegionClass, store: &PixelStore, config: &SegConfig) -> RegionSummary {
    let nbands = store.nbands();
    RegionSummary {
        label: region.label(),
        npix: region.npix(),
        means: config.region_sum_flag.then(|| {
            (0..nbands)
                .map(|band| region.unscaled_mean(store, band))
                .collect()
        }),
        std_devs: config.region_std_dev_flag.then(|| {
            (0..nbands)
                .map(|band| region.unscaled_std_dev(store, band, config.mean_norm_std_dev))
                .collect()
        }),
        band_max_std_dev: config
            .region_std_dev_flag
            .then(|| region.band_max_std_dev(config.mean_norm_std_dev)),
        boundary_npix: config
            .region_boundary_npix_flag
            .then(|| region.boundary_npix()),
        merge_threshold: config.region_threshold_flag.then(|| region.merge_threshold()),
        nghbrs: config
            .region_nghbrs_list_flag
            .then(|| region.nghbrs().iter().copied().collect()),
        region_objects: (region.nb_region_objects() > 0)
            .then(|| region.region_objects().iter().copied().collect()),
        nb_region_objects: (region.nb_region_objects() > 0)
            .then(|| region.nb_region_objects()),
    }
}

/// Follow merge chains from `label` to the active region owning it.
pub fn resolve_label(regions: &[RegionClass], label: u32) -> u32 {
    if label == 0 {
        return 0;
    }
    let mut current = label;
    let mut hops = 0usize;
    while !regions[(current - 1) as usize].active() {
        let target = regions[(current - 1) as usize].merge_target_label();
        if target == 0 {
            return current;
        }
        current = target;
        hops += 1;
        if hops > regions.len() {
            log::warn!("merge-target cycle detected at region {}", label);
            return current;
        }
    }
    current
}
