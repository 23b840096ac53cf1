//! Application state and main run loop with builder pattern.

use glam::{Affine3A, Quat, Vec3};
use kinfu_capture::{CaptureError, DepthSource, ImageSequenceSource, SyntheticSource, TUM_DEPTH_SCALE};
use kinfu_core::{FrameStatus, KinFu, KinFuError, KinFuParams, RenderMode, depth_preview};
use kinfu_data::{MeshParams, PlyError, reconstruct_mesh, write_cloud_ply, write_mesh_ply};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Fusion error: {0}")]
    Fusion(#[from] KinFuError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Export error: {0}")]
    Export(#[from] PlyError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where depth frames come from.
#[derive(Debug, Clone)]
pub enum InputConfig {
    /// Simulated sensor orbiting the tabletop scene.
    Synthetic { frames: u64 },
    /// Recorded sequence directory with `depth/` (and optionally `rgb/`) PNGs.
    Sequence { path: PathBuf, depth_scale: f32 },
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig::Synthetic { frames: 60 }
    }
}

/// Outputs written during and after the run.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub cloud: Option<PathBuf>,
    pub mesh: Option<PathBuf>,
    pub trajectory: Option<PathBuf>,
    pub render_dir: Option<PathBuf>,
    pub render_every: u64,
    pub render_mode: RenderMode,
    /// Upper bound on extracted points.
    pub max_points: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            cloud: None,
            mesh: None,
            trajectory: None,
            render_dir: None,
            render_every: 10,
            render_mode: RenderMode::Shaded,
            max_points: 5_000_000,
        }
    }
}

/// Logging configuration.
pub struct LoggingConfig {
    pub level: String,
    pub enable_tracy: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_tracy: false,
        }
    }
}

/// What a run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub frames: u64,
    pub tracked: u64,
    pub lost: u64,
    /// Frames dropped while waiting for a usable first frame.
    pub skipped: u64,
    pub points: usize,
    pub triangles: usize,
}

/// Builder for configuring and running the application.
pub struct AppBuilder {
    config_path: Option<PathBuf>,
    params: Option<KinFuParams>,
    input: InputConfig,
    output: OutputConfig,
    mesh: MeshParams,
    frame_limit: Option<u64>,
    logging: LoggingConfig,
    init_logging: bool,
}

impl AppBuilder {
    /// Create a new AppBuilder with default settings.
    pub fn new() -> Self {
        Self {
            config_path: None,
            params: None,
            input: InputConfig::default(),
            output: OutputConfig::default(),
            mesh: MeshParams::default(),
            frame_limit: None,
            logging: LoggingConfig::default(),
            init_logging: true,
        }
    }

    /// Load pipeline parameters from a JSON file.
    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Use these parameters instead of defaults or a config file.
    pub fn with_params(mut self, params: KinFuParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_input(mut self, input: InputConfig) -> Self {
        self.input = input;
        self
    }

    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.output = output;
        self
    }

    pub fn with_mesh_params(mut self, mesh: MeshParams) -> Self {
        self.mesh = mesh;
        self
    }

    /// Stop after this many frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Configure logging.
    pub fn with_logging(mut self, config: LoggingConfig) -> Self {
        self.logging = config;
        self
    }

    /// Leave the global subscriber alone (the caller installed one).
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    fn load_params(&mut self) -> Result<KinFuParams, AppError> {
        if let Some(params) = self.params.take() {
            return Ok(params);
        }
        match &self.config_path {
            Some(path) => {
                info!("Loading parameters from {}", path.display());
                Ok(KinFuParams::from_json_file(path)?)
            }
            None => Ok(KinFuParams::default_params()),
        }
    }

    /// Open the configured source. A synthetic orbit also moves the initial
    /// pose onto its first frame so poses compare against ground truth.
    fn open_source(&self, params: &mut KinFuParams) -> Result<Box<dyn DepthSource>, AppError> {
        Ok(match &self.input {
            InputConfig::Synthetic { frames } => {
                let source = SyntheticSource::new(params.intrinsics, params.cols as u32, params.rows as u32)
                    .with_frame_limit(*frames);
                params.initial_pose = source.pose_at(0).into();
                Box::new(source)
            }
            InputConfig::Sequence { path, depth_scale } => Box::new(
                ImageSequenceSource::open(path, params.intrinsics)?.with_depth_scale(*depth_scale),
            ),
        })
    }

    /// Run the application.
    pub fn run(mut self) -> Result<RunSummary, AppError> {
        if self.init_logging {
            self.init_logging();
        }

        let mut params = self.load_params()?;
        let mut source = self.open_source(&mut params)?;
        let (width, height) = source.resolution();
        fit_to_resolution(&mut params, width as usize, height as usize);

        if let Some(dir) = &self.output.render_dir {
            std::fs::create_dir_all(dir)?;
        }

        let mut kinfu = KinFu::new(params)?;
        let mut summary = RunSummary::default();
        let mut timestamps = Vec::new();

        while source.is_active() {
            if self.frame_limit.is_some_and(|limit| summary.frames >= limit) {
                source.stop();
                break;
            }
            let Some(frame) = source.grab()? else {
                std::thread::yield_now();
                continue;
            };

            let status = kinfu.step_frame(&frame.depth)?;
            summary.frames += 1;
            timestamps.push(frame.timestamp);
            match &status {
                FrameStatus::TrackingLost(reason) => {
                    summary.lost += 1;
                    warn!("Frame {}: tracking lost ({}), frame dropped", frame.frame_number, reason);
                }
                FrameStatus::EmptyModel => summary.skipped += 1,
                FrameStatus::Initialized | FrameStatus::Tracked { .. } => summary.tracked += 1,
            }

            if let Some(truth) = frame.ground_truth {
                let drift = (Vec3::from(kinfu.pose().translation) - Vec3::from(truth.translation)).length();
                debug!("Frame {}: {:?}, drift {:.4} m", frame.frame_number, status, drift);
            }

            if let Some(dir) = &self.output.render_dir
                && frame.frame_number % self.output.render_every.max(1) == 0
            {
                let image = kinfu.render_image(self.output.render_mode);
                image.save(dir.join(format!("render_{:06}.png", frame.frame_number)))?;
                depth_preview(&frame.depth).save(dir.join(format!("depth_{:06}.png", frame.frame_number)))?;
            }
        }
        kinfu.terminate();
        info!(
            "Processed {} frames ({} tracked, {} lost, {} skipped)",
            summary.frames, summary.tracked, summary.lost, summary.skipped
        );

        if let Some(path) = &self.output.trajectory {
            write_trajectory(path, &timestamps, kinfu.trajectory())?;
            info!("Trajectory written to {}", path.display());
        }

        if self.output.cloud.is_none() && self.output.mesh.is_none() {
            return Ok(summary);
        }

        let extraction = kinfu.extract_points(self.output.max_points);
        summary.points = extraction.cloud.len();
        if let Some(path) = &self.output.cloud {
            write_cloud_ply(path, &extraction.cloud)?;
            info!("Point cloud written to {}", path.display());
        }

        if let Some(path) = &self.output.mesh {
            info!("Generating mesh from {} points", extraction.cloud.len());
            let mesh = reconstruct_mesh(&extraction.cloud, &self.mesh);
            summary.triangles = mesh.triangle_count();
            if mesh.is_empty() {
                warn!("Mesh is empty, nothing written to {}", path.display());
            } else {
                write_mesh_ply(path, &mesh)?;
                info!("Mesh written to {}", path.display());
            }
        }

        Ok(summary)
    }

    fn init_logging(&self) {
        #[cfg(feature = "tracy")]
        {
            if self.logging.enable_tracy {
                use tracing_subscriber::Layer;
                use tracing_subscriber::layer::SubscriberExt;
                use tracing_subscriber::util::SubscriberInitExt;
                tracing_subscriber::registry()
                    .with(tracing_tracy::TracyLayer::default())
                    .with(
                        tracing_subscriber::fmt::layer().with_filter(
                            tracing_subscriber::EnvFilter::try_from_default_env()
                                .unwrap_or_else(|_| self.logging.level.clone().into()),
                        ),
                    )
                    .init();
                return;
            }
        }

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.logging.level)),
            )
            .with_target(false)
            .init();
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Adopt the source resolution, rescaling the intrinsics along with it.
fn fit_to_resolution(params: &mut KinFuParams, width: usize, height: usize) {
    if (width, height) == (params.cols, params.rows) {
        return;
    }
    let sx = width as f32 / params.cols as f32;
    let sy = height as f32 / params.rows as f32;
    warn!(
        "Source resolution {}x{} differs from configured {}x{}, rescaling intrinsics by {:.3}x{:.3}",
        width, height, params.cols, params.rows, sx, sy
    );
    params.intrinsics = params.intrinsics.scaled(sx, sy);
    params.cols = width;
    params.rows = height;
}

/// Write poses in TUM format: `timestamp tx ty tz qx qy qz qw` per line.
pub fn write_trajectory(path: &Path, timestamps: &[f64], poses: &[Affine3A]) -> Result<(), AppError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "# timestamp tx ty tz qx qy qz qw")?;
    for (t, pose) in timestamps.iter().zip(poses) {
        let q = Quat::from_mat3a(&pose.matrix3);
        let p = pose.translation;
        writeln!(
            out,
            "{:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6}",
            t, p.x, p.y, p.z, q.x, q.y, q.z, q.w
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Default depth scale for recorded sequences (TUM, 5000 units per metre).
pub const DEFAULT_DEPTH_SCALE: f32 = TUM_DEPTH_SCALE;

#[cfg(test)]
mod tests {
    use super::*;
    use glam::UVec3;
    use kinfu_core::{Intrinsics, PoseConfig};

    fn small_params() -> KinFuParams {
        let mut params = KinFuParams::default_params();
        params.cols = 160;
        params.rows = 120;
        params.intrinsics = Intrinsics::kinect(160, 120);
        params.volume_dims = UVec3::splat(96);
        params.volume_size = Vec3::splat(2.0);
        params.volume_pose = PoseConfig::from_translation(Vec3::new(-1.0, -1.0, 1.0));
        params
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kinfu-app-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_synthetic_run_exports() {
        let dir = temp_dir("run");
        let output = OutputConfig {
            cloud: Some(dir.join("cloud.ply")),
            mesh: Some(dir.join("mesh.ply")),
            trajectory: Some(dir.join("trajectory.txt")),
            render_dir: Some(dir.join("renders")),
            render_every: 2,
            ..OutputConfig::default()
        };

        let summary = AppBuilder::new()
            .without_logging()
            .with_params(small_params())
            .with_input(InputConfig::Synthetic { frames: 4 })
            .with_output(output)
            .run()
            .unwrap();

        assert_eq!(summary.frames, 4);
        assert_eq!(summary.lost, 0);
        assert!(summary.points > 0);
        assert!(summary.triangles > 0);
        assert!(dir.join("cloud.ply").exists());
        assert!(dir.join("mesh.ply").exists());
        assert!(dir.join("renders/render_000002.png").exists());
        assert!(dir.join("renders/depth_000000.png").exists());

        let trajectory = std::fs::read_to_string(dir.join("trajectory.txt")).unwrap();
        assert_eq!(trajectory.lines().count(), 5);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_resolution_mismatch_rescales_intrinsics() {
        let mut params = KinFuParams::default_params();
        fit_to_resolution(&mut params, 320, 240);
        assert_eq!((params.cols, params.rows), (320, 240));
        assert_eq!(params.intrinsics, Intrinsics::kinect(320, 240));

        let mut same = small_params();
        fit_to_resolution(&mut same, 160, 120);
        assert_eq!(same.intrinsics, Intrinsics::kinect(160, 120));
    }

    #[test]
    fn test_frame_limit_and_missing_sequence() {
        let summary = AppBuilder::new()
            .without_logging()
            .with_params(small_params())
            .with_input(InputConfig::Synthetic { frames: 10 })
            .with_frame_limit(2)
            .run()
            .unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.points, 0);

        let err = AppBuilder::new()
            .without_logging()
            .with_params(small_params())
            .with_input(InputConfig::Sequence {
                path: PathBuf::from("/nonexistent/kinfu"),
                depth_scale: DEFAULT_DEPTH_SCALE,
            })
            .run()
            .unwrap_err();
        assert!(matches!(err, AppError::Capture(CaptureError::NotFound(_))));
    }
}
