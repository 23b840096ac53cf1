//! Orbit synthetic scenes and check the reconstruction against them.

use glam::{Affine3A, Quat, UVec3, Vec3};
use kinfu_core::synthetic::{Primitive, Scene, orbit_pose};
use kinfu_core::{FrameStatus, Intrinsics, KinFu, KinFuParams, PoseConfig, TrackingState};

const W: usize = 160;
const H: usize = 120;
const FRAMES: usize = 15;

fn params(initial_pose: Affine3A) -> KinFuParams {
    let mut params = KinFuParams::default_params();
    params.cols = W;
    params.rows = H;
    params.intrinsics = Intrinsics::kinect(W, H);
    params.volume_dims = UVec3::splat(96);
    params.volume_size = Vec3::splat(2.0);
    params.volume_pose = PoseConfig::from_translation(Vec3::new(-1.0, -1.0, 1.0));
    params.initial_pose = initial_pose.into();
    params
}

fn ground_truth(frame: usize) -> Affine3A {
    let center = Vec3::new(-0.1, 0.3, 2.0);
    orbit_pose(center, 1.2, 0.4, (2.0 * frame as f32).to_radians())
}

fn rotation_error(a: &Affine3A, b: &Affine3A) -> f32 {
    let qa = Quat::from_mat3a(&a.matrix3);
    let qb = Quat::from_mat3a(&b.matrix3);
    qa.angle_between(qb)
}

#[test]
fn orbit_reconstructs_scene() {
    let scene = Scene::tabletop();
    let params = params(ground_truth(0));
    let intrinsics = params.intrinsics;
    let mut kinfu = KinFu::new(params).unwrap();

    for i in 0..FRAMES {
        let frame = scene.render_depth(&ground_truth(i), &intrinsics, W, H);
        let status = kinfu.step_frame(&frame).unwrap();
        if i == 0 {
            assert_eq!(status, FrameStatus::Initialized);
        } else {
            assert!(status.is_tracked(), "frame {i}: {status:?}");
        }
    }
    assert_eq!(kinfu.state(), TrackingState::Nominal);
    assert_eq!(kinfu.trajectory().len(), FRAMES);

    // Drift stays bounded.
    for (i, pose) in kinfu.trajectory().iter().enumerate() {
        let truth = ground_truth(i);
        let drift = (Vec3::from(pose.translation) - Vec3::from(truth.translation)).length();
        assert!(drift < 0.03, "frame {i}: translation drift {drift}");
        let angle = rotation_error(pose, &truth);
        assert!(angle < 3f32.to_radians(), "frame {i}: rotation drift {angle}");
    }

    // Extracted surface points lie on the scene.
    let extraction = kinfu.extract_points(usize::MAX);
    assert!(!extraction.is_truncated());
    let cloud = extraction.cloud;
    assert!(cloud.len() > 1000, "only {} points", cloud.len());
    let on_surface = cloud
        .points
        .iter()
        .filter(|p| scene.sdf(p.position).abs() < 0.02)
        .count();
    assert!(
        on_surface as f32 >= 0.95 * cloud.len() as f32,
        "{on_surface} of {} points near the surface",
        cloud.len()
    );
    assert!(cloud.has_normals());

    // The model renders from a pose it was never observed at.
    let raycast = kinfu.render_at(&ground_truth(FRAMES + 2));
    assert!(raycast.hit_count() > 1000);
}

/// A 0.5 m cube standing on a corner, so the camera sees at least three
/// faces from every direction of the orbit.
fn corner_cube() -> (Vec3, Quat, Scene) {
    let center = Vec3::new(0.0, 0.0, 2.0);
    let rotation = Quat::from_rotation_arc(Vec3::ONE.normalize(), Vec3::NEG_Y);
    let scene = Scene::new().with(Primitive::Cuboid {
        center,
        half_extents: Vec3::splat(0.25),
        rotation,
    });
    (center, rotation, scene)
}

#[test]
fn full_orbit_around_cube_closes_loop() {
    const STEPS: usize = 120;
    let (center, rotation, scene) = corner_cube();
    let truth = |i: usize| orbit_pose(center, 1.2, 0.4, (360.0 * i as f32 / STEPS as f32).to_radians());

    let mut params = params(truth(0));
    params.volume_dims = UVec3::splat(96);
    params.volume_size = Vec3::splat(1.2);
    params.volume_pose = PoseConfig::from_translation(center - Vec3::splat(0.6));
    let intrinsics = params.intrinsics;
    let mut kinfu = KinFu::new(params).unwrap();

    // Frame STEPS revisits the start of the circle.
    for i in 0..=STEPS {
        let frame = scene.render_depth(&truth(i), &intrinsics, W, H);
        let status = kinfu.step_frame(&frame).unwrap();
        assert!(status.is_tracked(), "frame {i}: {status:?}");
    }
    assert_eq!(kinfu.trajectory().len(), STEPS + 1);

    for (i, pose) in kinfu.trajectory().iter().enumerate() {
        let drift = (Vec3::from(pose.translation) - Vec3::from(truth(i).translation)).length();
        assert!(drift < 0.05, "frame {i}: translation drift {drift}");
    }

    let first = kinfu.trajectory()[0];
    let last = kinfu.pose();
    let gap = (Vec3::from(last.translation) - Vec3::from(first.translation)).length();
    assert!(gap < 0.05, "loop does not close: {gap} m");
    let angle = rotation_error(&last, &first);
    assert!(angle < 5f32.to_radians(), "loop does not close: {angle} rad");

    let cloud = kinfu.extract_points(usize::MAX).cloud;
    assert!(cloud.len() > 1000, "only {} points", cloud.len());
    let on_surface = cloud
        .points
        .iter()
        .filter(|p| scene.sdf(p.position).abs() < 0.02)
        .count();
    assert!(
        on_surface as f32 >= 0.9 * cloud.len() as f32,
        "{on_surface} of {} points near the cube",
        cloud.len()
    );

    // Every face was seen on the way round.
    let mut per_face = [0usize; 6];
    for point in &cloud.points {
        let local = rotation.inverse() * (point.position - center);
        let axis = local.abs().max_position();
        per_face[axis * 2 + (local[axis] < 0.0) as usize] += 1;
    }
    assert!(per_face.iter().all(|&n| n > 50), "points per face: {per_face:?}");
}

#[test]
fn capacity_bounds_extraction() {
    let scene = Scene::tabletop();
    let params = params(ground_truth(0));
    let intrinsics = params.intrinsics;
    let mut kinfu = KinFu::new(params).unwrap();
    kinfu
        .step_frame(&scene.render_depth(&ground_truth(0), &intrinsics, W, H))
        .unwrap();

    let extraction = kinfu.extract_points(100);
    assert_eq!(extraction.cloud.len(), 100);
    assert!(extraction.is_truncated());
    assert!(extraction.crossings > 100);

    kinfu.reset();
    let extraction = kinfu.extract_points(100);
    assert!(extraction.cloud.is_empty());
    assert!(!extraction.is_truncated());
}
