//! Per-frame fusion pipeline.
//!
//! The first frame is fused at the initial pose. Every later frame is aligned
//! against the ray-cast view of the model at the previous pose; on success
//! the pose is updated, the frame fused and the model view refreshed. A frame
//! that cannot be tracked leaves pose and volume untouched.

use crate::error::{KinFuError, TrackingFailure};
use crate::ingest::{DepthFrame, DepthMap, Preprocessor};
use crate::params::KinFuParams;
use crate::reconstruction::icp::PoseTracker;
use crate::render::{self, RenderMode};
use crate::scene::{Extraction, RayCaster, Raycast, TsdfVolume};
use glam::{Affine3A, Quat};
use image::RgbaImage;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    /// No frame fused yet.
    Uninitialized,
    /// The last frame was tracked.
    Nominal,
    /// The last frame could not be tracked; the pose is stale.
    AfterFailure,
    /// Stopped; no more frames are accepted.
    Terminated,
}

/// Outcome of [`KinFu::step_frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameStatus {
    /// First frame, fused at the initial pose.
    Initialized,
    /// No model surface could be built from the frame (no valid depth inside
    /// the volume). The session keeps waiting for a usable first frame.
    EmptyModel,
    /// Pose updated; `integrated` is false when the camera moved less than
    /// the configured minimum.
    Tracked { integrated: bool },
    /// Pose kept, frame dropped.
    TrackingLost(TrackingFailure),
}

impl FrameStatus {
    pub fn is_tracked(&self) -> bool {
        matches!(self, FrameStatus::Initialized | FrameStatus::Tracked { .. })
    }
}

/// Mutable tracking state of one reconstruction run.
#[derive(Debug, Clone)]
pub struct Session {
    pose: Affine3A,
    state: TrackingState,
    frame_count: u64,
    trajectory: Vec<Affine3A>,
}

impl Session {
    pub fn new(initial_pose: Affine3A) -> Self {
        Self {
            pose: initial_pose,
            state: TrackingState::Uninitialized,
            frame_count: 0,
            trajectory: Vec::new(),
        }
    }

    pub fn pose(&self) -> Affine3A {
        self.pose
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Pose after every processed frame.
    pub fn trajectory(&self) -> &[Affine3A] {
        &self.trajectory
    }
}

/// Mean of rotation angle (radians) and translation (metres) of a relative motion.
fn camera_movement(delta: &Affine3A) -> f32 {
    let rotation = Quat::from_mat3a(&delta.matrix3);
    let angle = rotation.angle_between(Quat::IDENTITY);
    (angle + delta.translation.length()) * 0.5
}

pub struct KinFu {
    params: KinFuParams,
    volume: TsdfVolume,
    preprocessor: Preprocessor,
    tracker: PoseTracker,
    raycaster: RayCaster,
    session: Session,
    reference: Option<Raycast>,
}

impl KinFu {
    /// Validate the parameters and allocate the volume.
    pub fn new(params: KinFuParams) -> Result<Self, KinFuError> {
        params.validate()?;
        let volume = TsdfVolume::from_params(&params)?;
        info!(
            "KinFu ready: {}x{} frames, {} pyramid levels",
            params.cols,
            params.rows,
            params.pyramid_levels()
        );

        Ok(Self {
            preprocessor: Preprocessor::new(&params),
            tracker: PoseTracker::new(&params),
            raycaster: RayCaster::new(&params),
            session: Session::new(params.initial_pose.affine()),
            reference: None,
            volume,
            params,
        })
    }

    pub fn params(&self) -> &KinFuParams {
        &self.params
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Current sensor pose (camera to world).
    pub fn pose(&self) -> Affine3A {
        self.session.pose
    }

    pub fn state(&self) -> TrackingState {
        self.session.state
    }

    pub fn trajectory(&self) -> &[Affine3A] {
        &self.session.trajectory
    }

    pub fn frame_count(&self) -> u64 {
        self.session.frame_count
    }

    pub fn volume(&self) -> &TsdfVolume {
        &self.volume
    }

    /// Model view at the current pose, refreshed after every fused frame.
    pub fn reference_render(&self) -> Option<&Raycast> {
        self.reference.as_ref()
    }

    /// Process one raw depth frame.
    #[tracing::instrument(skip_all, fields(frame = self.session.frame_count))]
    pub fn step_frame(&mut self, frame: &DepthFrame) -> Result<FrameStatus, KinFuError> {
        if self.session.state == TrackingState::Terminated {
            return Err(KinFuError::Terminated);
        }
        if frame.width() != self.params.cols || frame.height() != self.params.rows {
            return Err(KinFuError::FrameSize {
                expected_width: self.params.cols,
                expected_height: self.params.rows,
                width: frame.width(),
                height: frame.height(),
            });
        }

        let intrinsics = self.params.intrinsics;
        let depth = self.preprocessor.scale_depth(frame);

        let status = if self.session.state == TrackingState::Uninitialized {
            self.initialize(&depth)
        } else {
            let live = self.preprocessor.pyramid_from_depth(&depth);
            let reference = match self.reference.take() {
                Some(reference) => reference,
                None => self.raycaster.render(&self.volume, &self.session.pose, &intrinsics),
            };
            let model = reference.to_pyramid(self.params.pyramid_levels());

            match self
                .tracker
                .estimate_pose(&live, &model, &intrinsics, &Affine3A::IDENTITY)
            {
                Ok(result) => {
                    let pose = self.session.pose * result.transform;
                    let integrated = camera_movement(&result.transform) >= self.params.tsdf_min_camera_movement;
                    self.session.pose = pose;
                    self.session.state = TrackingState::Nominal;

                    if integrated {
                        self.volume.integrate(&depth, &intrinsics, &pose);
                    } else {
                        debug!("Camera barely moved, skipping integration");
                    }
                    self.reference = Some(self.raycaster.render(&self.volume, &pose, &intrinsics));
                    debug!("Tracked: rms {:.5} m over {} correspondences", result.rms, result.correspondences);
                    FrameStatus::Tracked { integrated }
                }
                Err(failure) => {
                    warn!("Tracking lost: {}", failure);
                    self.reference = Some(reference);
                    self.session.state = TrackingState::AfterFailure;
                    FrameStatus::TrackingLost(failure)
                }
            }
        };

        self.session.frame_count += 1;
        self.session.trajectory.push(self.session.pose);
        Ok(status)
    }

    fn initialize(&mut self, depth: &DepthMap) -> FrameStatus {
        let pose = self.session.pose;
        let intrinsics = self.params.intrinsics;
        if !depth.data().iter().any(|&d| d > 0.0) {
            warn!("First frame has no valid depth, waiting for the next one");
            return FrameStatus::EmptyModel;
        }

        self.volume.integrate(depth, &intrinsics, &pose);
        let reference = self.raycaster.render(&self.volume, &pose, &intrinsics);
        if reference.hit_count() == 0 {
            // Free-space carving alone leaves nothing to track against.
            self.volume.reset();
            warn!("First frame produced no surface inside the volume, waiting for the next one");
            return FrameStatus::EmptyModel;
        }

        self.reference = Some(reference);
        self.session.state = TrackingState::Nominal;
        info!("First frame fused at the initial pose");
        FrameStatus::Initialized
    }

    /// Ray cast the model at an arbitrary pose with the sensor intrinsics.
    pub fn render_at(&self, pose: &Affine3A) -> Raycast {
        self.raycaster.render(&self.volume, pose, &self.params.intrinsics)
    }

    /// Image of the model from the current pose.
    pub fn render_image(&self, mode: RenderMode) -> RgbaImage {
        match &self.reference {
            Some(reference) if reference.pose == self.session.pose => {
                render::render_raycast(reference, mode, self.params.light_position)
            }
            _ => self.render_image_at(&self.session.pose, mode),
        }
    }

    pub fn render_image_at(&self, pose: &Affine3A, mode: RenderMode) -> RgbaImage {
        render::render_raycast(&self.render_at(pose), mode, self.params.light_position)
    }

    pub fn extract_points(&self, capacity: usize) -> Extraction {
        self.volume.extract_points(capacity)
    }

    /// Clear the volume and start a new session at the initial pose.
    pub fn reset(&mut self) {
        self.volume.reset();
        self.session = Session::new(self.params.initial_pose.affine());
        self.reference = None;
        info!("Reconstruction reset");
    }

    /// Stop accepting frames. The model stays available for rendering and extraction.
    pub fn terminate(&mut self) {
        self.session.state = TrackingState::Terminated;
        info!("Session terminated after {} frames", self.session.frame_count);
    }
}
