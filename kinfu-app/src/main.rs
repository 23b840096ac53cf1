//! KinFu Application
//!
//! Fuses a depth stream into a TSDF model and exports the result.
//!
//! Inputs:
//! - Recorded sequences (`depth/` and optional `rgb/` PNG directories)
//! - A simulated sensor orbiting a synthetic tabletop scene
//!
//! Outputs: point cloud and mesh PLY files, a TUM trajectory and periodic
//! shaded renders of the model.

mod app;

use app::{AppBuilder, InputConfig, LoggingConfig, OutputConfig};
use clap::{Parser, ValueEnum};
use kinfu_core::RenderMode;
use kinfu_data::MeshParams;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum RenderModeArg {
    #[default]
    Shaded,
    Normals,
    Depth,
}

impl From<RenderModeArg> for RenderMode {
    fn from(mode: RenderModeArg) -> Self {
        match mode {
            RenderModeArg::Shaded => RenderMode::Shaded,
            RenderModeArg::Normals => RenderMode::Normals,
            RenderModeArg::Depth => RenderMode::Depth,
        }
    }
}

/// KinFu - dense surface reconstruction from depth streams
#[derive(Parser, Debug)]
#[command(name = "kinfu")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Sequence directory with depth/ PNGs (synthetic orbit when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// JSON file with pipeline parameters
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of frames to process
    #[arg(short, long)]
    frames: Option<u64>,

    /// Write the extracted point cloud to this PLY file
    #[arg(long)]
    cloud_out: Option<PathBuf>,

    /// Write a reconstructed mesh to this PLY file
    #[arg(long)]
    mesh_out: Option<PathBuf>,

    /// Write the camera trajectory (TUM format) to this file
    #[arg(long)]
    trajectory_out: Option<PathBuf>,

    /// Directory for periodic renders of the model
    #[arg(long)]
    render_dir: Option<PathBuf>,

    /// Save a render every N frames
    #[arg(long, default_value_t = 10)]
    render_every: u64,

    /// Render style
    #[arg(long, value_enum, default_value_t = RenderModeArg::Shaded)]
    render_mode: RenderModeArg,

    /// Raw depth units per metre of recorded sequences
    #[arg(long, default_value_t = app::DEFAULT_DEPTH_SCALE)]
    depth_scale: f32,

    /// Upper bound on extracted points
    #[arg(long, default_value_t = 5_000_000)]
    max_points: usize,

    /// Longest triangle edge kept in the mesh (metres)
    #[arg(long, default_value_t = 0.1)]
    mesh_max_edge: f32,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Stream spans to Tracy (requires the `tracy` feature)
    #[arg(long)]
    tracy: bool,
}

fn main() {
    let args = Args::parse();

    let input = match args.input {
        Some(path) => InputConfig::Sequence {
            path,
            depth_scale: args.depth_scale,
        },
        None => InputConfig::Synthetic {
            frames: args.frames.unwrap_or(90),
        },
    };

    let mut builder = AppBuilder::new()
        .with_input(input)
        .with_output(OutputConfig {
            cloud: args.cloud_out,
            mesh: args.mesh_out,
            trajectory: args.trajectory_out,
            render_dir: args.render_dir,
            render_every: args.render_every,
            render_mode: args.render_mode.into(),
            max_points: args.max_points,
        })
        .with_mesh_params(MeshParams {
            max_edge_length: args.mesh_max_edge,
            ..MeshParams::default()
        })
        .with_logging(LoggingConfig {
            level: args.log_level,
            enable_tracy: args.tracy,
        });
    if let Some(path) = args.config {
        builder = builder.with_config_file(path);
    }
    if let Some(frames) = args.frames {
        builder = builder.with_frame_limit(frames);
    }

    match builder.run() {
        Ok(summary) => println!(
            "Fused {} frames ({} lost, {} skipped), {} points, {} triangles",
            summary.frames, summary.lost, summary.skipped, summary.points, summary.triangles
        ),
        Err(e) => {
            eprintln!("Application error: {}", e);
            std::process::exit(1);
        }
    }
}
