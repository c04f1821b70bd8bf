//! Command-line interface for hseg-core
//!
//! Loads a raster image, runs the segmentation engine and writes the
//! hierarchy of segmentations as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use hseg_core::{
    segment, DerivedParams, Dims, DissimCrit, Normalization, ProgramMode, Raster, SegConfig,
};

#[derive(Parser)]
#[command(name = "hseg")]
#[command(about = "Recursive hierarchical image segmentation (HSWO/HSeg/RHSeg)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment an image and write the hierarchy as JSON
    Segment {
        /// Input image file (PNG)
        input: PathBuf,

        /// Output JSON file
        output: PathBuf,

        /// Configuration JSON file (optional)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Program mode: hswo, hseg or rhseg
        #[arg(long, default_value = "hseg")]
        mode: String,

        /// Dissimilarity criterion (1-10)
        #[arg(long, default_value = "6")]
        criterion: u8,

        /// Spectral clustering weight (0.0 disables it)
        #[arg(long, default_value = "0.1")]
        spclust_wght: f64,

        /// Region count at which the run converges
        #[arg(long, default_value = "2")]
        conv_nregions: u32,

        /// Region counts at which to emit hierarchy levels
        #[arg(long, value_delimiter = ',')]
        out_nregions: Vec<u32>,

        /// Optional edge image (PNG, grayscale)
        #[arg(long)]
        edge: Option<PathBuf>,
    },

    /// Print the derived engine parameters for an image
    Describe {
        /// Input image file (PNG)
        input: PathBuf,

        /// Configuration JSON file (optional)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Segment {
            input,
            output,
            config,
            mode,
            criterion,
            spclust_wght,
            conv_nregions,
            out_nregions,
            edge,
        } => segment_command(
            input,
            output,
            config,
            mode,
            criterion,
            spclust_wght,
            conv_nregions,
            out_nregions,
            edge,
        ),
        Commands::Describe { input, config } => describe_command(input, config),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SegConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse config file {}", path.display()))
        }
        None => Ok(SegConfig::default()),
    }
}

/// Decode a PNG into a band-interleaved raster (RGB or grayscale).
fn load_raster(path: &PathBuf) -> Result<Raster> {
    let img = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?;
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let dims = Dims::new_2d(width as usize, height as usize);

    let gray = rgb.pixels().all(|p| p[0] == p[1] && p[1] == p[2]);
    let nbands = if gray { 1 } else { 3 };
    let mut bands = Vec::with_capacity(dims.npixels() * nbands);
    for pixel in rgb.pixels() {
        if gray {
            bands.push(pixel[0] as f32);
        } else {
            bands.extend_from_slice(&[pixel[0] as f32, pixel[1] as f32, pixel[2] as f32]);
        }
    }

    log::info!(
        "loaded {}: {}x{}, {} band(s)",
        path.display(),
        width,
        height,
        nbands
    );
    Ok(Raster {
        dims,
        nbands,
        bands,
        mask: None,
        local_std_dev: None,
        edge_value: None,
        edge_mask: None,
        region_map: None,
    })
}

/// Decode a grayscale PNG as an edge image scaled to [0, 1].
fn load_edge_image(path: &PathBuf, dims: &Dims) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("failed to open edge image {}", path.display()))?;
    let gray = img.to_luma8();
    if gray.width() as usize != dims.ncols || gray.height() as usize != dims.nrows {
        anyhow::bail!(
            "edge image is {}x{}, expected {}x{}",
            gray.width(),
            gray.height(),
            dims.ncols,
            dims.nrows
        );
    }
    Ok(gray.pixels().map(|p| p[0] as f32 / 255.0).collect())
}

fn parse_mode(mode: &str) -> Result<ProgramMode> {
    match mode.to_ascii_lowercase().as_str() {
        "hswo" => Ok(ProgramMode::Hswo),
        "hseg" => Ok(ProgramMode::Hseg),
        "rhseg" => Ok(ProgramMode::Rhseg),
        other => anyhow::bail!("unknown program mode '{other}' (expected hswo, hseg or rhseg)"),
    }
}

#[allow(clippy::too_many_arguments)]
fn segment_command(
    input: PathBuf,
    output: PathBuf,
    config_path: Option<PathBuf>,
    mode: String,
    criterion: u8,
    spclust_wght: f64,
    conv_nregions: u32,
    out_nregions: Vec<u32>,
    edge: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config_path.as_ref())?;
    if config_path.is_none() {
        config.program_mode = parse_mode(&mode)?;
        config.dissim_crit = DissimCrit::from_index(criterion)?;
        config.spclust_wght = spclust_wght;
        config.conv_nregions = conv_nregions;
        config.hseg_out_nregions = out_nregions;
        config.normind = Normalization::PerBand;
    }

    let mut raster = load_raster(&input)?;
    if let Some(edge_path) = &edge {
        raster.edge_value = Some(load_edge_image(edge_path, &raster.dims)?);
    }

    let start = Instant::now();
    let result = segment(&raster, &config).context("segmentation failed")?;
    log::info!(
        "segmented to {} regions across {} hierarchy levels in {:.2?}",
        result.nregions,
        result.hierarchy.len(),
        start.elapsed()
    );

    let json = serde_json::to_string_pretty(&result.hierarchy)
        .context("failed to serialize hierarchy")?;
    fs::write(&output, json)
        .with_context(|| format!("failed to write output {}", output.display()))?;
    println!(
        "{} regions, {} hierarchy levels -> {}",
        result.nregions,
        result.hierarchy.len(),
        output.display()
    );
    Ok(())
}

fn describe_command(input: PathBuf, config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path.as_ref())?;
    let raster = load_raster(&input)?;
    let derived = DerivedParams::derive(&config, &raster.dims)?;

    println!("image: {}x{}, {} band(s)", raster.dims.ncols, raster.dims.nrows, raster.nbands);
    println!("dimensions:        {}", derived.nb_dimensions);
    println!("neighbor dirs:     {}", derived.maxnbdir);
    println!("recursive levels:  {}", derived.rnb_levels);
    println!("data I/O levels:   {}", derived.ionb_levels);
    println!("seam size:         {}", derived.seam_size);
    println!("sumsq needed:      {}", derived.region_sumsq_flag);
    println!("sumxlogx needed:   {}", derived.region_sumxlogx_flag);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing_accepts_all_three() {
        assert_eq!(parse_mode("hswo").unwrap(), ProgramMode::Hswo);
        assert_eq!(parse_mode("HSEG").unwrap(), ProgramMode::Hseg);
        assert_eq!(parse_mode("rhseg").unwrap(), ProgramMode::Rhseg);
        assert!(parse_mode("other").is_err());
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.conv_nregions, 2);
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = SegConfig::default();
        config.conv_nregions = 7;
        config.spclust_wght = 0.25;
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.conv_nregions, 7);
        assert!((loaded.spclust_wght - 0.25).abs() < 1e-12);
    }
}
