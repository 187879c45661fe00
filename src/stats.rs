use std::collections::VecDeque;
use std::time::Duration;

use crate::raster::DrawStats;

/// Timings and counters of the last frames, all durations reported in milliseconds.
#[derive(Debug)]
pub struct FrameStats {
    frame_time: Duration,
    scene_update_time: Duration,
    mesh_draw_time: Duration,
    gpu_time: Duration,
    draws: DrawStats,
    frame_time_ms_log: RingLog<f32>,
    gpu_time_ms_log: RingLog<f32>,
    pub total_frame_count: u64,
    frame_count: u32,
    fps_counter: u32,
    timer: Duration,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            frame_time: Duration::ZERO,
            scene_update_time: Duration::ZERO,
            mesh_draw_time: Duration::ZERO,
            gpu_time: Duration::ZERO,
            draws: DrawStats::default(),
            frame_time_ms_log: RingLog::new(Self::MAX_LOG_SIZE),
            gpu_time_ms_log: RingLog::new(Self::MAX_LOG_SIZE),
            total_frame_count: 0,
            frame_count: 0,
            fps_counter: 0,
            timer: Duration::ZERO,
        }
    }
}

impl FrameStats {
    const ONE_SEC: Duration = Duration::from_secs(1);
    pub const MAX_LOG_SIZE: usize = 1000;

    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tick(&mut self, frame_time: Duration) {
        self.frame_time = frame_time;
        self.frame_time_ms_log.push(as_ms(frame_time));
        self.gpu_time_ms_log.push(as_ms(self.gpu_time));

        self.total_frame_count += 1;
        self.frame_count += 1;
        self.timer += frame_time;

        // fps is the frame count of the last full second
        if self.timer > Self::ONE_SEC {
            self.fps_counter = self.frame_count;
            self.frame_count = 0;
            self.timer -= Self::ONE_SEC;
        }
    }

    pub(crate) fn set_scene_update_time(&mut self, time: Duration) {
        self.scene_update_time = time;
    }

    pub(crate) fn set_mesh_draw_time(&mut self, time: Duration) {
        self.mesh_draw_time = time;
    }

    pub(crate) fn set_gpu_time(&mut self, time: Duration) {
        self.gpu_time = time;
    }

    pub(crate) fn set_draws(&mut self, draws: DrawStats) {
        self.draws = draws;
    }

    pub fn frame_time_ms(&self) -> f32 {
        as_ms(self.frame_time)
    }

    pub fn scene_update_time_ms(&self) -> f32 {
        as_ms(self.scene_update_time)
    }

    pub fn mesh_draw_time_ms(&self) -> f32 {
        as_ms(self.mesh_draw_time)
    }

    pub fn gpu_time_ms(&self) -> f32 {
        as_ms(self.gpu_time)
    }

    pub fn draw_calls(&self) -> u32 {
        self.draws.draw_calls
    }

    pub fn triangles(&self) -> u32 {
        self.draws.triangles
    }

    pub fn fps(&self) -> u32 {
        self.fps_counter
    }

    pub fn frame_time_ms_log(&self) -> impl Iterator<Item = f32> + '_ {
        self.frame_time_ms_log.iter()
    }

    pub fn gpu_time_ms_log(&self) -> impl Iterator<Item = f32> + '_ {
        self.gpu_time_ms_log.iter()
    }
}

fn as_ms(duration: Duration) -> f32 {
    duration.as_secs_f32() * 1000.0
}

#[derive(Debug)]
struct RingLog<T> {
    values: VecDeque<T>,
    max_size: usize,
}

impl<T: Copy> RingLog<T> {
    fn new(max_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    fn push(&mut self, value: T) {
        if self.values.len() == self.max_size {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.values.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_counts_the_frames_of_the_last_second() {
        let mut stats = FrameStats::new();
        assert_eq!(stats.fps(), 0);

        for _ in 0..61 {
            stats.tick(Duration::from_micros(16_667));
        }

        assert_eq!(stats.fps(), 60);
        assert_eq!(stats.total_frame_count, 61);
    }

    #[test]
    fn timings_are_reported_in_milliseconds() {
        let mut stats = FrameStats::new();
        stats.set_scene_update_time(Duration::from_micros(1500));
        stats.set_mesh_draw_time(Duration::from_millis(2));
        stats.set_gpu_time(Duration::from_micros(250));
        stats.tick(Duration::from_millis(16));

        assert!((stats.scene_update_time_ms() - 1.5).abs() < 1e-4);
        assert!((stats.mesh_draw_time_ms() - 2.0).abs() < 1e-4);
        assert!((stats.gpu_time_ms() - 0.25).abs() < 1e-4);
        assert!((stats.frame_time_ms() - 16.0).abs() < 1e-4);
    }

    #[test]
    fn draw_counters_come_from_the_last_recording() {
        let mut stats = FrameStats::new();
        stats.set_draws(DrawStats {
            draw_calls: 3,
            triangles: 36,
        });

        assert_eq!(stats.draw_calls(), 3);
        assert_eq!(stats.triangles(), 36);
    }

    #[test]
    fn ring_log_keeps_the_latest_values() {
        let mut log = RingLog::new(3);
        for i in 0..5 {
            log.push(i);
        }

        assert_eq!(log.iter().collect::<Vec<_>>(), vec![2, 3, 4]);
    }
}
