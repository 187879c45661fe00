use glam::Mat4;
use log::{debug, info};

/// Value of the accumulation counter right after a reset. It is incremented before the frame
/// is recorded, so the first frame after a reset observes 0.
pub const RESTART_ACCUMULATION: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPath {
    Rasterization,
    RayTracing,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameRequest {
    pub ray_tracing_requested: bool,
    pub structures_ready: bool,
    pub view: Mat4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePlan {
    pub path: RenderPath,
    pub accumulated_frame: i64,
    pub restarted: bool,
    /// False once the accumulation cap is reached; the accumulated image is only copied out.
    pub dispatch_rays: bool,
}

/// Chooses the render path of every frame and tracks the progressive accumulation counter.
#[derive(Debug)]
pub struct PathSelector {
    previous_path: Option<RenderPath>,
    accumulated_frames: i64,
    last_view: Option<Mat4>,
    max_accumulated_frames: u32,
    logged_not_ready: bool,
}

impl PathSelector {
    pub fn new(max_accumulated_frames: u32) -> Self {
        Self {
            previous_path: None,
            accumulated_frames: RESTART_ACCUMULATION,
            last_view: None,
            max_accumulated_frames,
            logged_not_ready: false,
        }
    }

    pub fn accumulated_frames(&self) -> i64 {
        self.accumulated_frames
    }

    pub fn previous_path(&self) -> Option<RenderPath> {
        self.previous_path
    }

    /// Forces the next frame to start a new accumulation, e.g. after the output images were
    /// recreated.
    pub fn invalidate(&mut self) {
        self.accumulated_frames = RESTART_ACCUMULATION;
    }

    pub fn begin_frame(&mut self, request: FrameRequest) -> FramePlan {
        let path = self.select_path(request);
        let mut restarted = false;

        if self.previous_path.is_some_and(|previous| previous != path) {
            info!("Switching render path to {path:?}");
            self.accumulated_frames = RESTART_ACCUMULATION;
            restarted = true;
        }

        if self.last_view.is_some_and(|view| view != request.view) {
            self.accumulated_frames = RESTART_ACCUMULATION;
            restarted = true;
        }

        self.previous_path = Some(path);
        self.last_view = Some(request.view);
        self.accumulated_frames += 1;

        let dispatch_rays = path == RenderPath::RayTracing
            && self.accumulated_frames < self.max_accumulated_frames as i64;

        FramePlan {
            path,
            accumulated_frame: self.accumulated_frames,
            restarted,
            dispatch_rays,
        }
    }

    fn select_path(&mut self, request: FrameRequest) -> RenderPath {
        if !request.ray_tracing_requested {
            return RenderPath::Rasterization;
        }

        if !request.structures_ready {
            if !self.logged_not_ready {
                debug!("Ray tracing requested before the acceleration structures are ready, rasterizing");
                self.logged_not_ready = true;
            }
            return RenderPath::Rasterization;
        }

        self.logged_not_ready = false;
        RenderPath::RayTracing
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    fn request(ray_tracing: bool, view: Mat4) -> FrameRequest {
        FrameRequest {
            ray_tracing_requested: ray_tracing,
            structures_ready: true,
            view,
        }
    }

    #[test]
    fn first_frame_observes_zero() {
        let mut selector = PathSelector::new(16);
        assert_eq!(selector.accumulated_frames(), RESTART_ACCUMULATION);

        let plan = selector.begin_frame(request(false, Mat4::IDENTITY));

        assert_eq!(plan.path, RenderPath::Rasterization);
        assert_eq!(plan.accumulated_frame, 0);
        assert!(!plan.dispatch_rays);
    }

    #[test]
    fn toggling_ray_tracing_restarts_accumulation() {
        let mut selector = PathSelector::new(16);
        for _ in 0..5 {
            selector.begin_frame(request(false, Mat4::IDENTITY));
        }
        assert_eq!(selector.accumulated_frames(), 4);

        let plan = selector.begin_frame(request(true, Mat4::IDENTITY));

        assert!(plan.restarted);
        assert_eq!(plan.path, RenderPath::RayTracing);
        assert_eq!(plan.accumulated_frame, RESTART_ACCUMULATION + 1);
        assert!(plan.dispatch_rays);

        let plan = selector.begin_frame(request(true, Mat4::IDENTITY));
        assert!(!plan.restarted);
        assert_eq!(plan.accumulated_frame, 1);

        let plan = selector.begin_frame(request(false, Mat4::IDENTITY));
        assert!(plan.restarted);
        assert_eq!(plan.accumulated_frame, 0);
    }

    #[test]
    fn moving_the_camera_restarts_accumulation() {
        let mut selector = PathSelector::new(16);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        selector.begin_frame(request(true, view));
        selector.begin_frame(request(true, view));
        assert_eq!(selector.accumulated_frames(), 1);

        let moved = Mat4::look_at_rh(Vec3::new(1.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let plan = selector.begin_frame(request(true, moved));

        assert!(plan.restarted);
        assert_eq!(plan.accumulated_frame, 0);
    }

    #[test]
    fn rasterizes_until_structures_are_ready() {
        let mut selector = PathSelector::new(16);

        let plan = selector.begin_frame(FrameRequest {
            ray_tracing_requested: true,
            structures_ready: false,
            view: Mat4::IDENTITY,
        });
        assert_eq!(plan.path, RenderPath::Rasterization);
        assert!(!plan.dispatch_rays);

        let plan = selector.begin_frame(request(true, Mat4::IDENTITY));
        assert_eq!(plan.path, RenderPath::RayTracing);
        assert!(plan.restarted);
        assert_eq!(plan.accumulated_frame, 0);
    }

    #[test]
    fn dispatch_stops_at_the_accumulation_cap() {
        let mut selector = PathSelector::new(3);

        let dispatched = (0..6)
            .map(|_| selector.begin_frame(request(true, Mat4::IDENTITY)).dispatch_rays)
            .collect::<Vec<_>>();

        assert_eq!(dispatched, vec![true, true, true, false, false, false]);
        assert_eq!(selector.previous_path(), Some(RenderPath::RayTracing));
    }

    #[test]
    fn invalidate_restarts_without_a_path_change() {
        let mut selector = PathSelector::new(3);
        for _ in 0..4 {
            selector.begin_frame(request(true, Mat4::IDENTITY));
        }

        selector.invalidate();
        let plan = selector.begin_frame(request(true, Mat4::IDENTITY));

        assert_eq!(plan.accumulated_frame, 0);
        assert!(plan.dispatch_rays);
    }
}
