//! Pixel-level data store
//!
//! Band values are normalized once at construction; after that the store is
//! read-only apart from region-label assignment and the per-pixel init flag
//! used by the first-merge grower.

use crate::config::{Dims, Normalization, SegConfig};
use crate::error::{SegResult, SegmentationError};

/// Raw multiband raster input, as delivered by the loader collaborator.
///
/// Band values are interleaved by pixel: `bands[pixel * nbands + band]`.
#[derive(Debug, Clone)]
pub struct Raster {
    pub dims: Dims,
    pub nbands: usize,
    pub bands: Vec<f32>,
    /// Data quality mask; `None` means every pixel is good
    pub mask: Option<Vec<bool>>,
    /// Optional per-pixel, per-band local standard deviation feature
    pub local_std_dev: Option<Vec<f32>>,
    /// Optional edge image
    pub edge_value: Option<Vec<f32>>,
    /// Validity mask for the edge image
    pub edge_mask: Option<Vec<bool>>,
    /// Optional externally supplied initial region labeling (0 = unassigned)
    pub region_map: Option<Vec<u32>>,
}

impl Raster {
    /// Convenience constructor for fully valid single-band data.
    pub fn single_band(dims: Dims, bands: Vec<f32>) -> Self {
        Self {
            dims,
            nbands: 1,
            bands,
            mask: None,
            local_std_dev: None,
            edge_value: None,
            edge_mask: None,
            region_map: None,
        }
    }
}

/// Normalized per-pixel data plus the current region labeling
#[derive(Debug, Clone)]
pub struct PixelStore {
    dims: Dims,
    nbands: usize,
    values: Vec<f32>,
    mask: Vec<bool>,
    local_std_dev: Option<Vec<f32>>,
    edge_value: Option<Vec<f32>>,
    edge_mask: Option<Vec<bool>>,
    labels: Vec<u32>,
    init_flags: Vec<bool>,
    scale: Vec<f64>,
    offset: Vec<f64>,
    /// Mean normalized value per band (over good pixels)
    meanval: Vec<f64>,
    min_edge_value: f32,
    max_edge_value: f32,
}

impl PixelStore {
    pub fn new(raster: &Raster, config: &SegConfig) -> SegResult<Self> {
        let npixels = raster.dims.npixels();
        if npixels == 0 {
            return Err(SegmentationError::input_error("empty raster"));
        }
        if raster.nbands == 0 {
            return Err(SegmentationError::input_error("raster has zero bands"));
        }
        if raster.bands.len() != npixels * raster.nbands {
            return Err(SegmentationError::input_error(format!(
                "band buffer holds {} values, expected {}",
                raster.bands.len(),
                npixels * raster.nbands
            )));
        }
        for (name, len) in [
            ("mask", raster.mask.as_ref().map(Vec::len)),
            ("edge_value", raster.edge_value.as_ref().map(Vec::len)),
            ("edge_mask", raster.edge_mask.as_ref().map(Vec::len)),
            ("region_map", raster.region_map.as_ref().map(Vec::len)),
        ] {
            if let Some(len) = len {
                if len != npixels {
                    return Err(SegmentationError::input_error(format!(
                        "{name} buffer holds {len} values, expected {npixels}"
                    )));
                }
            }
        }
        if let Some(sd) = &raster.local_std_dev {
            if sd.len() != npixels * raster.nbands {
                return Err(SegmentationError::input_error(format!(
                    "local_std_dev buffer holds {} values, expected {}",
                    sd.len(),
                    npixels * raster.nbands
                )));
            }
        }

        let mask = raster
            .mask
            .clone()
            .unwrap_or_else(|| vec![true; npixels]);

        let (scale, offset) = band_scaling(raster, &mask, config.normind);

        let mut values = vec![0.0f32; npixels * raster.nbands];
        for pixel in 0..npixels {
            for band in 0..raster.nbands {
                let idx = pixel * raster.nbands + band;
                let v = raster.bands[idx] as f64;
                values[idx] = (scale[band] * (v - offset[band])) as f32;
            }
        }

        // The local std-dev feature scales like the data but takes no offset.
        let local_std_dev = raster.local_std_dev.as_ref().map(|sd| {
            let mut scaled = vec![0.0f32; sd.len()];
            for pixel in 0..npixels {
                for band in 0..raster.nbands {
                    let idx = pixel * raster.nbands + band;
                    scaled[idx] = (scale[band] * sd[idx] as f64) as f32;
                }
            }
            scaled
        });

        let mut meanval = vec![0.0f64; raster.nbands];
        let mut good = 0usize;
        for pixel in 0..npixels {
            if mask[pixel] {
                good += 1;
                for band in 0..raster.nbands {
                    meanval[band] += values[pixel * raster.nbands + band] as f64;
                }
            }
        }
        if good > 0 {
            for m in &mut meanval {
                *m /= good as f64;
            }
        }

        let (min_edge_value, max_edge_value) = edge_range(raster);

        let labels = raster
            .region_map
            .clone()
            .unwrap_or_else(|| vec![0u32; npixels]);

        log::debug!(
            "pixel store: {} pixels, {} bands, {} good, edge range [{}, {}]",
            npixels,
            raster.nbands,
            good,
            min_edge_value,
            max_edge_value
        );

        Ok(Self {
            dims: raster.dims,
            nbands: raster.nbands,
            values,
            mask,
            local_std_dev,
            edge_value: raster.edge_value.clone(),
            edge_mask: raster.edge_mask.clone(),
            labels,
            init_flags: vec![false; npixels],
            scale,
            offset,
            meanval,
            min_edge_value,
            max_edge_value,
        })
    }

    pub fn dims(&self) -> &Dims {
        &self.dims
    }

    pub fn nbands(&self) -> usize {
        self.nbands
    }

    pub fn npixels(&self) -> usize {
        self.dims.npixels()
    }

    /// Is this pixel good data?
    pub fn mask(&self, pixel: usize) -> bool {
        self.mask[pixel]
    }

    /// Normalized band value
    pub fn value(&self, pixel: usize, band: usize) -> f32 {
        self.values[pixel * self.nbands + band]
    }

    pub fn has_local_std_dev(&self) -> bool {
        self.local_std_dev.is_some()
    }

    /// Normalized local standard deviation feature (0 when absent)
    pub fn local_std_dev(&self, pixel: usize, band: usize) -> f32 {
        match &self.local_std_dev {
            Some(sd) => sd[pixel * self.nbands + band],
            None => 0.0,
        }
    }

    pub fn has_edge_image(&self) -> bool {
        self.edge_value.is_some()
    }

    pub fn edge_mask(&self, pixel: usize) -> bool {
        match &self.edge_mask {
            Some(m) => m[pixel],
            None => self.edge_value.is_some(),
        }
    }

    pub fn edge_value(&self, pixel: usize) -> f32 {
        match &self.edge_value {
            Some(e) => e[pixel],
            None => 0.0,
        }
    }

    pub fn min_edge_value(&self) -> f32 {
        self.min_edge_value
    }

    pub fn max_edge_value(&self) -> f32 {
        self.max_edge_value
    }

    pub fn region_label(&self, pixel: usize) -> u32 {
        self.labels[pixel]
    }

    pub fn set_region_label(&mut self, pixel: usize, label: u32) {
        self.labels[pixel] = label;
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn init_flag(&self, pixel: usize) -> bool {
        self.init_flags[pixel]
    }

    pub fn set_init_flag(&mut self, pixel: usize, value: bool) {
        self.init_flags[pixel] = value;
    }

    pub fn clear_init_flags(&mut self) {
        self.init_flags.iter_mut().for_each(|f| *f = false);
    }

    pub fn scale(&self, band: usize) -> f64 {
        self.scale[band]
    }

    pub fn offset(&self, band: usize) -> f64 {
        self.offset[band]
    }

    /// Mean normalized value in `band` over good pixels
    pub fn meanval(&self, band: usize) -> f64 {
        self.meanval[band]
    }

    /// Count of masked-out pixels
    pub fn masked_pixel_count(&self) -> usize {
        self.mask.iter().filter(|&&m| !m).count()
    }

    /// Renumber every assigned pixel label through `relabel`, leaving
    /// unassigned pixels untouched.
    pub fn relabel(&mut self, relabel: impl Fn(u32) -> u32) {
        for label in &mut self.labels {
            if *label != 0 {
                *label = relabel(*label);
            }
        }
    }
}

/// Half-open bounds of one processing window inside the full raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub col0: usize,
    pub col1: usize,
    pub row0: usize,
    pub row1: usize,
    pub slice0: usize,
    pub slice1: usize,
}

impl WindowBounds {
    /// The whole raster as a single window.
    pub fn full(dims: &Dims) -> Self {
        Self {
            col0: 0,
            col1: dims.ncols,
            row0: 0,
            row1: dims.nrows,
            slice0: 0,
            slice1: dims.nslices,
        }
    }

    pub fn contains(&self, col: usize, row: usize, slice: usize) -> bool {
        col >= self.col0
            && col < self.col1
            && row >= self.row0
            && row < self.row1
            && slice >= self.slice0
            && slice < self.slice1
    }

    pub fn npixels(&self) -> usize {
        (self.col1 - self.col0) * (self.row1 - self.row0) * (self.slice1 - self.slice0)
    }

    /// Iterate pixel indices inside the window in (slice, row, col) order.
    pub fn pixels<'a>(&'a self, dims: &'a Dims) -> impl Iterator<Item = usize> + 'a {
        let ncols = dims.ncols;
        let frame = dims.ncols * dims.nrows;
        (self.slice0..self.slice1).flat_map(move |slice| {
            (self.row0..self.row1).flat_map(move |row| {
                (self.col0..self.col1).map(move |col| col + row * ncols + slice * frame)
            })
        })
    }
}

/// Per-band scale/offset for the selected normalization mode. Offset stays
/// zero so non-negative inputs remain valid for the entropy criterion.
fn band_scaling(
    raster: &Raster,
    mask: &[bool],
    normind: Normalization,
) -> (Vec<f64>, Vec<f64>) {
    let nbands = raster.nbands;
    let offset = vec![0.0f64; nbands];
    if normind == Normalization::None {
        return (vec![1.0; nbands], offset);
    }

    let npixels = raster.dims.npixels();
    let mut sum = vec![0.0f64; nbands];
    let mut sumsq = vec![0.0f64; nbands];
    let mut good = 0usize;
    for pixel in 0..npixels {
        if !mask[pixel] {
            continue;
        }
        good += 1;
        for band in 0..nbands {
            let v = raster.bands[pixel * nbands + band] as f64;
            sum[band] += v;
            sumsq[band] += v * v;
        }
    }
    if good == 0 {
        return (vec![1.0; nbands], offset);
    }

    let variance = |band: usize| {
        let mean = sum[band] / good as f64;
        (sumsq[band] / good as f64 - mean * mean).max(0.0)
    };

    let scale = match normind {
        Normalization::None => vec![1.0; nbands],
        Normalization::PerBand => (0..nbands)
            .map(|band| {
                let sigma = variance(band).sqrt();
                if sigma > 0.0 {
                    1.0 / sigma
                } else {
                    1.0
                }
            })
            .collect(),
        Normalization::AcrossBands => {
            let mean_var =
                (0..nbands).map(variance).sum::<f64>() / nbands as f64;
            let sigma = mean_var.sqrt();
            let s = if sigma > 0.0 { 1.0 / sigma } else { 1.0 };
            vec![s; nbands]
        }
    };
    (scale, offset)
}

fn edge_range(raster: &Raster) -> (f32, f32) {
    let mut min_edge = f32::MAX;
    let mut max_edge = f32::MIN;
    if let Some(edge) = &raster.edge_value {
        for (pixel, &e) in edge.iter().enumerate() {
            let valid = raster
                .edge_mask
                .as_ref()
                .map(|m| m[pixel])
                .unwrap_or(true);
            if valid {
                min_edge = min_edge.min(e);
                max_edge = max_edge.max(e);
            }
        }
    }
    if min_edge > max_edge {
        (0.0, 1.0)
    } else if min_edge == max_edge {
        // Degenerate edge images normalize to factor 1.
        (min_edge - 1.0, max_edge)
    } else {
        (min_edge, max_edge)
    }
}
