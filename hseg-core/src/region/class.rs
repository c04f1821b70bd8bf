//! Per-class region statistics and merge bookkeeping
//!
//! Regions live in a single flat table indexed by `label - 1`. Neighbor
//! relations hold labels only, never references, so merge bookkeeping stays
//! acyclic and the table can be mutated one region at a time.

use std::collections::{BTreeMap, BTreeSet};

use crate::dissim::{self, DissimParams};
use crate::heap::HEAP_NONE;
use crate::pixel::PixelStore;

use super::seam::RegionSeam;

/// Aggregate statistics and merge state for one region class
#[derive(Debug, Clone)]
pub struct RegionClass {
    pub(crate) active: bool,
    pub(crate) initial_merge_flag: bool,
    pub(crate) seam_flag: bool,
    pub(crate) merged_flag: bool,
    pub(crate) large_nghbr_merged_flag: bool,
    pub(crate) label: u32,
    pub(crate) npix: u32,
    /// npix snapshot taken at the last neighbor-heap insert/update
    pub(crate) nghbr_heap_npix: u32,
    /// npix snapshot taken at the last region-heap insert/update
    pub(crate) region_heap_npix: u32,
    pub(crate) sum: Vec<f64>,
    pub(crate) sumsq: Option<Vec<f64>>,
    pub(crate) sumxlogx: Option<Vec<f64>>,
    pub(crate) sum_pixel_std_dev: Option<Vec<f64>>,
    pub(crate) max_edge_value: f32,
    pub(crate) nghbrs: BTreeSet<u32>,
    pub(crate) best_nghbr_labels: BTreeSet<u32>,
    pub(crate) best_nghbr_dissim: f32,
    pub(crate) nghbr_heap_index: u32,
    pub(crate) best_region_labels: BTreeSet<u32>,
    pub(crate) best_region_dissim: f32,
    pub(crate) region_heap_index: u32,
    /// label -> seam statistics; populated only during seam processing
    pub(crate) seam_nghbrs: BTreeMap<u32, RegionSeam>,
    pub(crate) merge_target_label: u32,
    pub(crate) merge_threshold: f64,
    pub(crate) nb_region_objects: u32,
    pub(crate) region_objects: BTreeSet<u32>,
    pub(crate) boundary_npix: u32,
}

impl RegionClass {
    pub fn new(
        label: u32,
        nbands: usize,
        sumsq_flag: bool,
        sumxlogx_flag: bool,
        std_dev_flag: bool,
    ) -> Self {
        Self {
            active: false,
            initial_merge_flag: false,
            seam_flag: false,
            merged_flag: false,
            large_nghbr_merged_flag: false,
            label,
            npix: 0,
            nghbr_heap_npix: 0,
            region_heap_npix: 0,
            sum: vec![0.0; nbands],
            sumsq: sumsq_flag.then(|| vec![0.0; nbands]),
            sumxlogx: sumxlogx_flag.then(|| vec![0.0; nbands]),
            sum_pixel_std_dev: std_dev_flag.then(|| vec![0.0; nbands]),
            max_edge_value: f32::MIN,
            nghbrs: BTreeSet::new(),
            best_nghbr_labels: BTreeSet::new(),
            best_nghbr_dissim: f32::MAX,
            nghbr_heap_index: HEAP_NONE,
            best_region_labels: BTreeSet::new(),
            best_region_dissim: f32::MAX,
            region_heap_index: HEAP_NONE,
            seam_nghbrs: BTreeMap::new(),
            merge_target_label: 0,
            merge_threshold: 0.0,
            nb_region_objects: 0,
            region_objects: BTreeSet::new(),
            boundary_npix: 0,
        }
    }

    /// Reset to an inactive prototype. The label is preserved.
    pub fn clear(&mut self) {
        self.active = false;
        self.initial_merge_flag = false;
        self.seam_flag = false;
        self.merged_flag = false;
        self.large_nghbr_merged_flag = false;
        self.npix = 0;
        self.nghbr_heap_npix = 0;
        self.region_heap_npix = 0;
        self.sum.iter_mut().for_each(|v| *v = 0.0);
        if let Some(v) = &mut self.sumsq {
            v.iter_mut().for_each(|v| *v = 0.0);
        }
        if let Some(v) = &mut self.sumxlogx {
            v.iter_mut().for_each(|v| *v = 0.0);
        }
        if let Some(v) = &mut self.sum_pixel_std_dev {
            v.iter_mut().for_each(|v| *v = 0.0);
        }
        self.max_edge_value = f32::MIN;
        self.nghbrs.clear();
        self.seam_nghbrs.clear();
        self.merge_target_label = 0;
        self.partial_clear();
    }

    /// Reset transient merge/heap state only.
    pub fn partial_clear(&mut self) {
        self.best_nghbr_labels.clear();
        self.best_nghbr_dissim = f32::MAX;
        self.nghbr_heap_index = HEAP_NONE;
        self.best_region_labels.clear();
        self.best_region_dissim = f32::MAX;
        self.region_heap_index = HEAP_NONE;
        self.merge_threshold = 0.0;
        self.nb_region_objects = 0;
        self.region_objects.clear();
        self.boundary_npix = 0;
    }

    /// Fold one pixel's contribution into this region.
    pub(crate) fn add_pixel(&mut self, store: &PixelStore, pixel: usize) {
        self.active = true;
        self.merged_flag = true;
        self.npix += 1;
        for band in 0..store.nbands() {
            let value = store.value(pixel, band) as f64;
            self.sum[band] += value;
            if let Some(sumsq) = &mut self.sumsq {
                sumsq[band] += value * value;
            }
            if let Some(sumxlogx) = &mut self.sumxlogx {
                sumxlogx[band] += value * value.ln();
            }
            if let Some(spsd) = &mut self.sum_pixel_std_dev {
                spsd[band] += store.local_std_dev(pixel, band) as f64;
            }
        }
        if store.has_edge_image() && store.edge_mask(pixel) {
            let edge = store.edge_value(pixel);
            if edge > self.max_edge_value {
                self.max_edge_value = edge;
            }
        }
    }

    pub fn label(&self) -> u32 {
        self.label
    }

    pub fn npix(&self) -> u32 {
        self.npix
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn sum(&self, band: usize) -> f64 {
        self.sum[band]
    }

    pub fn mean(&self, band: usize) -> f64 {
        self.sum[band] / self.npix as f64
    }

    /// Mean in the input data's original units.
    pub fn unscaled_mean(&self, store: &PixelStore, band: usize) -> f64 {
        self.mean(band) / store.scale(band) + store.offset(band)
    }

    pub fn unscaled_std_dev(&self, store: &PixelStore, band: usize, mean_norm: bool) -> f64 {
        self.std_dev(band, mean_norm) / store.scale(band)
    }

    pub fn initial_merge_flag(&self) -> bool {
        self.initial_merge_flag
    }

    pub fn seam_flag(&self) -> bool {
        self.seam_flag
    }

    pub fn merged_flag(&self) -> bool {
        self.merged_flag
    }

    pub fn large_nghbr_merged_flag(&self) -> bool {
        self.large_nghbr_merged_flag
    }

    pub fn max_edge_value(&self) -> f32 {
        self.max_edge_value
    }

    pub fn nghbrs(&self) -> &BTreeSet<u32> {
        &self.nghbrs
    }

    pub fn best_nghbr_dissim(&self) -> f32 {
        self.best_nghbr_dissim
    }

    pub fn best_region_dissim(&self) -> f32 {
        self.best_region_dissim
    }

    pub fn merge_target_label(&self) -> u32 {
        self.merge_target_label
    }

    pub fn merge_threshold(&self) -> f64 {
        self.merge_threshold
    }

    pub fn boundary_npix(&self) -> u32 {
        self.boundary_npix
    }

    pub fn nb_region_objects(&self) -> u32 {
        self.nb_region_objects
    }

    pub fn region_objects(&self) -> &BTreeSet<u32> {
        &self.region_objects
    }

    /// Attach results from the connected-component collaborator.
    pub fn set_region_object_info(
        &mut self,
        region_objects: BTreeSet<u32>,
        boundary_npix: u32,
    ) {
        self.nb_region_objects = region_objects.len() as u32;
        self.region_objects = region_objects;
        self.boundary_npix = boundary_npix;
    }

    pub fn is_neighbor(&self, label: u32) -> bool {
        self.nghbrs.contains(&label)
    }

    pub fn is_best_neighbor(&self, label: u32) -> bool {
        self.best_nghbr_labels.contains(&label)
    }

    pub fn is_best_region(&self, label: u32) -> bool {
        self.best_region_labels.contains(&label)
    }

    pub(crate) fn clear_best_nghbr(&mut self) {
        self.best_nghbr_labels.clear();
        self.best_nghbr_dissim = f32::MAX;
    }

    pub(crate) fn clear_best_region(&mut self) {
        self.best_region_labels.clear();
        self.best_region_dissim = f32::MAX;
    }

    /// Region standard deviation in `band`.
    ///
    /// The `(sum * sum) / npix` intermediate and its subtraction from the
    /// sum of squares are squeezed through f32; that coarsening is what
    /// keeps merge ordering stable across platforms.
    pub fn std_dev(&self, band: usize, mean_norm: bool) -> f64 {
        let spsd = self
            .sum_pixel_std_dev
            .as_ref()
            .map(|v| v[band])
            .unwrap_or(0.0);
        if self.npix <= 1 {
            if mean_norm {
                return if self.sum[band] != 0.0 {
                    spsd / self.sum[band]
                } else {
                    0.0
                };
            }
            return spsd;
        }
        let sumsq = match &self.sumsq {
            Some(v) => v[band],
            None => return 0.0,
        };
        let numpix = self.npix as f64;

        let sumf = ((self.sum[band] * self.sum[band]) / numpix) as f32;
        let sumsqf = sumsq as f32;
        let tempf = sumsqf - sumf;
        let mut std_dev = tempf as f64 / (numpix - 1.0);
        std_dev = if std_dev > 0.0 { std_dev.sqrt() } else { 0.0 };

        // Small regions blend toward the local per-pixel std-dev feature.
        if self.npix < 9 && self.sum_pixel_std_dev.is_some() {
            let factor = (9.0 - numpix) / 9.0;
            std_dev = factor * spsd / numpix + (1.0 - factor) * std_dev;
        }

        if mean_norm {
            std_dev = if self.sum[band] != 0.0 {
                numpix * std_dev / self.sum[band]
            } else {
                0.0
            };
        }
        std_dev
    }

    /// Maximum std-dev over bands.
    pub fn band_max_std_dev(&self, mean_norm: bool) -> f64 {
        (0..self.sum.len())
            .map(|band| self.std_dev(band, mean_norm))
            .fold(0.0, f64::max)
    }

    /// Mutable references to two distinct table entries.
    pub(crate) fn pair_mut(
        regions: &mut [RegionClass],
        a: usize,
        b: usize,
    ) -> (&mut RegionClass, &mut RegionClass) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = regions.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = regions.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Merge `absorbed_label` into `absorber_label`.
    ///
    /// Preconditions (enforced by the merge engine, not here): both regions
    /// are active and the absorber is the larger-npix-or-smaller-label one.
    pub(crate) fn merge_pair(
        regions: &mut [RegionClass],
        absorber_label: u32,
        absorbed_label: u32,
        threshold: f64,
    ) {
        let ai = (absorber_label - 1) as usize;
        let bi = (absorbed_label - 1) as usize;
        log::debug!(
            "merging region {} into region {} with merge threshold = {}",
            absorbed_label,
            absorber_label,
            threshold
        );

        let nghbr_labels: Vec<u32> = {
            let (absorber, absorbed) = Self::pair_mut(regions, ai, bi);
            if !absorber.active {
                log::warn!(
                    "region {} is inactive: can't participate in a merge",
                    absorber.label
                );
            }
            if !absorbed.active {
                log::warn!(
                    "region {} is inactive: can't participate in a merge",
                    absorbed.label
                );
            }

            absorber.merge_threshold = threshold;
            absorber.initial_merge_flag |= absorbed.initial_merge_flag;
            absorber.seam_flag |= absorbed.seam_flag;
            absorber.merged_flag = true;

            absorber.npix += absorbed.npix;
            for band in 0..absorber.sum.len() {
                absorber.sum[band] += absorbed.sum[band];
            }
            if let (Some(a), Some(b)) = (&mut absorber.sumsq, &absorbed.sumsq) {
                for band in 0..a.len() {
                    a[band] += b[band];
                }
            }
            if let (Some(a), Some(b)) = (&mut absorber.sumxlogx, &absorbed.sumxlogx) {
                for band in 0..a.len() {
                    a[band] += b[band];
                }
            }
            if let (Some(a), Some(b)) =
                (&mut absorber.sum_pixel_std_dev, &absorbed.sum_pixel_std_dev)
            {
                for band in 0..a.len() {
                    a[band] += b[band];
                }
            }
            if absorber.max_edge_value < absorbed.max_edge_value {
                absorber.max_edge_value = absorbed.max_edge_value;
            }

            for &nghbr in &absorbed.nghbrs {
                absorber.nghbrs.insert(nghbr);
            }
            absorber.nghbrs.remove(&absorber_label);
            absorber.nghbrs.remove(&absorbed_label);

            absorbed.active = false;
            absorbed.merge_target_label = absorber_label;
            absorbed.merged_flag = true;

            absorber.nghbrs.iter().copied().collect()
        };

        // Re-point every neighbor that knew the absorbed region.
        for nghbr in nghbr_labels {
            let region = &mut regions[(nghbr - 1) as usize];
            if region.nghbrs.remove(&absorbed_label) {
                region.nghbrs.insert(absorber_label);
                if region.best_nghbr_labels.remove(&absorbed_label) {
                    region.best_nghbr_labels.insert(absorber_label);
                }
            }
        }
    }

    /// Recompute the best-neighbor record from scratch, keeping the full set
    /// of neighbors tied at the minimum.
    pub(crate) fn recompute_best_neighbor(
        regions: &mut [RegionClass],
        label: u32,
        params: &DissimParams,
    ) {
        let idx = (label - 1) as usize;
        let nghbr_labels: Vec<u32> = regions[idx].nghbrs.iter().copied().collect();
        let mut best_labels = BTreeSet::new();
        let mut best_dissim = f32::MAX;
        for nghbr in nghbr_labels {
            let dissim =
                dissim::neighbor_dissim(&regions[idx], &regions[(nghbr - 1) as usize], params);
            if dissim < best_dissim {
                best_labels.clear();
                best_labels.insert(nghbr);
                best_dissim = dissim;
            } else if dissim == best_dissim {
                best_labels.insert(nghbr);
            }
        }
        let region = &mut regions[idx];
        region.best_nghbr_labels = best_labels;
        region.best_nghbr_dissim = best_dissim;
    }

    /// Offer one fresh neighbor pairing; replaces or extends the best set
    /// without rescanning the whole neighborhood.
    pub(crate) fn update_best_neighbor(
        regions: &mut [RegionClass],
        label: u32,
        nghbr_label: u32,
        params: &DissimParams,
    ) {
        let idx = (label - 1) as usize;
        let dissim = dissim::neighbor_dissim(
            &regions[idx],
            &regions[(nghbr_label - 1) as usize],
            params,
        );
        let region = &mut regions[idx];
        if dissim < region.best_nghbr_dissim {
            region.best_nghbr_labels.clear();
            region.best_nghbr_labels.insert(nghbr_label);
            region.best_nghbr_dissim = dissim;
        } else if dissim == region.best_nghbr_dissim {
            region.best_nghbr_labels.insert(nghbr_label);
        }
    }

    /// Offer one fresh non-spatial pairing for the region channel.
    pub(crate) fn update_best_region(
        regions: &mut [RegionClass],
        label: u32,
        other_label: u32,
        params: &DissimParams,
    ) {
        let idx = (label - 1) as usize;
        let dissim = dissim::region_channel_dissim(
            &regions[idx],
            &regions[(other_label - 1) as usize],
            params,
        );
        let region = &mut regions[idx];
        if dissim < region.best_region_dissim {
            region.best_region_labels.clear();
            region.best_region_labels.insert(other_label);
            region.best_region_dissim = dissim;
        } else if dissim == region.best_region_dissim {
            region.best_region_labels.insert(other_label);
        }
    }

    /// Out of the tied best-neighbor set, the label whose region has
    /// (largest npix, then smallest label). Inactive entries are skipped;
    /// returns 0 when none survive.
    pub(crate) fn pick_best_neighbor(regions: &[RegionClass], label: u32) -> u32 {
        Self::pick_from_set(regions, &regions[(label - 1) as usize].best_nghbr_labels)
    }

    pub(crate) fn pick_best_region(regions: &[RegionClass], label: u32) -> u32 {
        Self::pick_from_set(regions, &regions[(label - 1) as usize].best_region_labels)
    }

    fn pick_from_set(regions: &[RegionClass], set: &BTreeSet<u32>) -> u32 {
        let mut pick = 0u32;
        let mut pick_npix = 0u32;
        for &candidate in set {
            let region = &regions[(candidate - 1) as usize];
            if !region.active {
                continue;
            }
            if region.npix > pick_npix
                || (region.npix == pick_npix && (pick == 0 || region.label < pick))
            {
                pick = region.label;
                pick_npix = region.npix;
            }
        }
        pick
    }

    /// Neighbor-set symmetry audit: every neighbor must be active and must
    /// know this region back.
    pub fn check_neighbors(regions: &[RegionClass], label: u32) -> bool {
        let region = &regions[(label - 1) as usize];
        if !region.active {
            return true;
        }
        let mut ok = true;
        for &nghbr in &region.nghbrs {
            let other = &regions[(nghbr - 1) as usize];
            if !other.active {
                log::warn!(
                    "region {}: neighbor {} is inactive",
                    label,
                    nghbr
                );
                ok = false;
            } else if !other.nghbrs.contains(&label) {
                log::warn!(
                    "region {}: nonsymmetric neighbor set (missing from region {})",
                    label,
                    nghbr
                );
                ok = false;
            }
        }
        ok
    }

    /// Merge `absorbed_label` into `absorber_label` on the seam graph,
    /// folding seam statistics pair by pair.
    pub(crate) fn merge_seam_pair(
        regions: &mut [RegionClass],
        absorber_label: u32,
        absorbed_label: u32,
    ) {
        let ai = (absorber_label - 1) as usize;
        let bi = (absorbed_label - 1) as usize;
        log::debug!(
            "merging seam region {} into seam region {}",
            absorbed_label,
            absorber_label
        );

        let nghbr_labels: Vec<u32> = {
            let (absorber, absorbed) = Self::pair_mut(regions, ai, bi);
            absorbed.active = false;
            absorbed.merge_target_label = absorber_label;

            let absorbed_map = std::mem::take(&mut absorbed.seam_nghbrs);
            for (seam_label, seam) in absorbed_map {
                absorber
                    .seam_nghbrs
                    .entry(seam_label)
                    .and_modify(|existing| existing.accumulate(&seam))
                    .or_insert(seam);
            }
            absorber.seam_nghbrs.remove(&absorber_label);
            absorber.seam_nghbrs.remove(&absorbed_label);
            absorber.seam_nghbrs.keys().copied().collect()
        };

        for nghbr in nghbr_labels {
            let region = &mut regions[(nghbr - 1) as usize];
            if let Some(seam) = region.seam_nghbrs.remove(&absorbed_label) {
                region
                    .seam_nghbrs
                    .entry(absorber_label)
                    .and_modify(|existing| existing.accumulate(&seam))
                    .or_insert(seam);
            }
        }
    }

    /// Test scaffolding: make this region active with the given size and
    /// per-band means.
    #[cfg(test)]
    pub(crate) fn seed_for_test(&mut self, npix: u32, means: &[f64]) {
        self.active = true;
        self.npix = npix;
        self.nghbr_heap_npix = npix;
        self.region_heap_npix = npix;
        for (band, &mean) in means.iter().enumerate() {
            self.sum[band] = mean * npix as f64;
            if let Some(sumsq) = &mut self.sumsq {
                sumsq[band] = mean * mean * npix as f64;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DerivedParams, Dims, Normalization, SegConfig};
    use crate::dissim::DissimCrit;
    use crate::pixel::Raster;

    fn table(specs: &[(u32, u32, f64, &[u32])]) -> Vec<RegionClass> {
        let mut regions = Vec::new();
        for &(label, npix, mean, nghbrs) in specs {
            let mut r = RegionClass::new(label, 1, true, false, false);
            r.seed_for_test(npix, &[mean]);
            r.nghbrs = nghbrs.iter().copied().collect();
            regions.push(r);
        }
        regions
    }

    fn test_params() -> DissimParams {
        let config = SegConfig {
            dissim_crit: DissimCrit::OneNorm,
            normind: Normalization::None,
            ..SegConfig::default()
        };
        let raster = Raster::single_band(Dims::new_1d(2), vec![0.0, 1.0]);
        let store = PixelStore::new(&raster, &config).unwrap();
        let derived = DerivedParams::derive(&config, store.dims()).unwrap();
        DissimParams::new(&config, &derived, &store, 1)
    }

    #[test]
    fn merge_pair_accumulates_and_relinks() {
        // 1 - 2 - 3 in a line
        let mut regions = table(&[
            (1, 4, 1.0, &[2]),
            (2, 2, 2.0, &[1, 3]),
            (3, 3, 5.0, &[2]),
        ]);
        RegionClass::merge_pair(&mut regions, 1, 2, 0.5);

        let r1 = &regions[0];
        assert!(r1.active);
        assert_eq!(r1.npix, 6);
        assert!((r1.sum(0) - 8.0).abs() < 1e-12);
        assert_eq!(r1.nghbrs, [3u32].into_iter().collect());
        assert!((r1.merge_threshold - 0.5).abs() < 1e-12);

        let r2 = &regions[1];
        assert!(!r2.active);
        assert_eq!(r2.merge_target_label, 1);

        // Region 3's neighbor entry for 2 re-pointed at 1.
        let r3 = &regions[2];
        assert_eq!(r3.nghbrs, [1u32].into_iter().collect());
    }

    #[test]
    fn merge_pair_repoints_best_neighbor_sets() {
        let mut regions = table(&[
            (1, 4, 1.0, &[2]),
            (2, 2, 2.0, &[1, 3]),
            (3, 3, 5.0, &[2]),
        ]);
        regions[2].best_nghbr_labels = [2u32].into_iter().collect();
        regions[2].best_nghbr_dissim = 3.0;
        RegionClass::merge_pair(&mut regions, 1, 2, 0.5);
        assert!(regions[2].is_best_neighbor(1));
        assert!(!regions[2].is_best_neighbor(2));
    }

    #[test]
    fn recompute_best_neighbor_keeps_full_tied_set() {
        // Region 2 sits between two equally distant regions.
        let mut regions = table(&[
            (1, 2, 1.0, &[2]),
            (2, 2, 2.0, &[1, 3]),
            (3, 2, 3.0, &[2]),
        ]);
        let params = test_params();
        RegionClass::recompute_best_neighbor(&mut regions, 2, &params);
        assert_eq!(regions[1].best_nghbr_labels.len(), 2);
        assert!((regions[1].best_nghbr_dissim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pick_prefers_larger_npix_then_smaller_label() {
        let mut regions = table(&[
            (1, 2, 1.0, &[]),
            (2, 4, 2.0, &[]),
            (3, 4, 3.0, &[]),
            (4, 1, 0.0, &[]),
        ]);
        regions[3].best_nghbr_labels = [1u32, 2, 3].into_iter().collect();
        assert_eq!(RegionClass::pick_best_neighbor(&regions, 4), 2);

        // Inactive candidates are skipped.
        regions[1].active = false;
        assert_eq!(RegionClass::pick_best_neighbor(&regions, 4), 3);

        // All candidates inactive: nothing to pick.
        regions[2].active = false;
        regions[0].active = false;
        assert_eq!(RegionClass::pick_best_neighbor(&regions, 4), 0);
    }

    #[test]
    fn partial_clear_keeps_statistics() {
        let mut region = RegionClass::new(5, 1, true, false, false);
        region.seed_for_test(8, &[2.0]);
        region.best_nghbr_labels.insert(7);
        region.best_nghbr_dissim = 1.5;
        region.nghbr_heap_index = 3;
        region.best_region_labels.insert(9);
        region.merge_threshold = 0.25;
        region.boundary_npix = 4;

        region.partial_clear();

        assert_eq!(region.label(), 5);
        assert_eq!(region.npix(), 8);
        assert!((region.sum(0) - 16.0).abs() < 1e-12);
        assert!(region.best_nghbr_labels.is_empty());
        assert_eq!(region.best_nghbr_dissim, f32::MAX);
        assert_eq!(region.nghbr_heap_index, HEAP_NONE);
        assert!(!region.is_best_region(9));
        assert_eq!(region.merge_threshold(), 0.0);
        assert_eq!(region.boundary_npix(), 0);
    }

    #[test]
    fn region_object_info_is_attachable() {
        let mut region = RegionClass::new(1, 1, false, false, false);
        region.seed_for_test(10, &[1.0]);
        region.set_region_object_info([3u32, 8, 11].into_iter().collect(), 14);
        assert_eq!(region.nb_region_objects(), 3);
        assert!(region.region_objects().contains(&8));
        assert_eq!(region.boundary_npix(), 14);
    }

    #[test]
    fn membership_predicates_track_their_sets() {
        let mut region = RegionClass::new(1, 1, false, false, false);
        region.nghbrs.insert(2);
        region.best_nghbr_labels.insert(2);
        region.best_region_labels.insert(4);
        assert!(region.is_neighbor(2));
        assert!(!region.is_neighbor(3));
        assert!(region.is_best_neighbor(2));
        assert!(region.is_best_region(4));
        assert!(!region.is_best_region(2));
    }

    #[test]
    fn check_neighbors_flags_asymmetry() {
        let mut regions = table(&[(1, 2, 1.0, &[2]), (2, 2, 2.0, &[1])]);
        assert!(RegionClass::check_neighbors(&regions, 1));
        regions[1].nghbrs.clear();
        assert!(!RegionClass::check_neighbors(&regions, 1));
    }

    #[test]
    fn std_dev_blend_below_nine_pixels() {
        let mut region = RegionClass::new(1, 1, true, false, true);
        region.active = true;
        region.npix = 4;
        // Four values: 1, 1, 3, 3 -> sample variance 4/3
        region.sum[0] = 8.0;
        region.sumsq.as_mut().unwrap()[0] = 20.0;
        region.sum_pixel_std_dev.as_mut().unwrap()[0] = 2.0;

        let sample = (4.0f64 / 3.0).sqrt();
        let factor = (9.0 - 4.0) / 9.0;
        let expected = factor * 2.0 / 4.0 + (1.0 - factor) * sample;
        assert!((region.std_dev(0, false) - expected).abs() < 1e-6);
    }

    #[test]
    fn mean_normalized_std_dev_divides_by_mean() {
        let mut region = RegionClass::new(1, 1, true, false, false);
        region.active = true;
        region.npix = 16;
        region.sum[0] = 32.0;
        region.sumsq.as_mut().unwrap()[0] = 80.0;
        let plain = region.std_dev(0, false);
        let normed = region.std_dev(0, true);
        assert!((normed - 16.0 * plain / 32.0).abs() < 1e-9);
    }

    #[test]
    fn seam_merge_folds_pair_statistics() {
        let mut regions = table(&[
            (1, 4, 1.0, &[]),
            (2, 4, 1.0, &[]),
            (3, 4, 2.0, &[]),
        ]);
        regions[0].seam_nghbrs.insert(3, RegionSeam::new(2, 0.2));
        regions[1].seam_nghbrs.insert(3, RegionSeam::new(1, 0.1));
        regions[2].seam_nghbrs.insert(1, RegionSeam::new(2, 0.2));
        regions[2].seam_nghbrs.insert(2, RegionSeam::new(1, 0.1));

        RegionClass::merge_seam_pair(&mut regions, 1, 2);

        let merged = &regions[0].seam_nghbrs[&3];
        assert_eq!(merged.npix, 3);
        assert!((merged.sum_edge - 0.3).abs() < 1e-6);

        // Region 3's map now points only at region 1, with the pooled seam.
        assert!(!regions[2].seam_nghbrs.contains_key(&2));
        let other = &regions[2].seam_nghbrs[&1];
        assert_eq!(other.npix, 3);
    }
}
