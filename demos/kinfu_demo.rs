//! Fuse a simulated orbit around the tabletop scene and save the model.
//!
//! Run with `cargo run --release --example kinfu_demo`.

use glam::{UVec3, Vec3};
use kinfu::capture::{DepthSource, SyntheticSource};
use kinfu::fusion::{FrameStatus, KinFu, KinFuParams};
use tracing::{info, warn};

const FRAMES: u64 = 90;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut params = KinFuParams::default_params();
    params.volume_dims = UVec3::splat(256);
    let mut source = SyntheticSource::new(params.intrinsics, params.cols as u32, params.rows as u32)
        .with_frame_limit(FRAMES);
    params.initial_pose = source.pose_at(0).into();
    let mut kinfu = KinFu::new(params)?;

    let mut worst_drift = 0.0f32;
    while let Some(frame) = source.grab()? {
        if let FrameStatus::TrackingLost(reason) = kinfu.step_frame(&frame.depth)? {
            warn!("Frame {} lost: {}", frame.frame_number, reason);
        }
        if let Some(truth) = frame.ground_truth {
            let drift = (Vec3::from(kinfu.pose().translation) - Vec3::from(truth.translation)).length();
            worst_drift = worst_drift.max(drift);
        }
    }
    info!("{} frames fused, worst drift {:.1} mm", kinfu.frame_count(), worst_drift * 1000.0);

    let extraction = kinfu.extract_points(2_000_000);
    let path = std::env::temp_dir().join("kinfu_demo_cloud.ply");
    kinfu::data::write_cloud_ply(&path, &extraction.cloud)?;
    info!("{} points written to {}", extraction.cloud.len(), path.display());
    Ok(())
}
