//! Per-frame draw logic: latch the newest producer image, draw it with the
//! current transform, and feed the encoder tap at a reduced rate.

use glam::Mat4;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Gpu, ImageStream, TextureId};
use crate::encoder::EncoderBinding;
use crate::error::Result;
use crate::signal::FrameAvailabilitySignal;
use crate::transform::Transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Uninitialized,
    Ready,
    Drawing,
    Destroyed,
}

/// How often drawn frames are handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderPacing {
    /// Every other draw tick, by tick parity.
    #[default]
    Alternate,
    /// At most one frame per interval, by wall clock.
    MinInterval { millis: u64 },
}

#[derive(Debug)]
struct Pacer {
    pacing: EncoderPacing,
    flip: bool,
    last: Option<Instant>,
}

impl Pacer {
    fn new(pacing: EncoderPacing) -> Self {
        Self {
            pacing,
            flip: true,
            last: None,
        }
    }

    fn admit(&mut self, now: Instant) -> bool {
        match self.pacing {
            EncoderPacing::Alternate => {
                self.flip = !self.flip;
                self.flip
            }
            EncoderPacing::MinInterval { millis } => {
                let interval = Duration::from_millis(millis);
                let due = self
                    .last
                    .map_or(true, |last| now.duration_since(last) >= interval);
                if due {
                    self.last = Some(now);
                }
                due
            }
        }
    }
}

/// Outcome of one draw tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    pub latched: bool,
    pub forwarded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopStats {
    pub ticks: u64,
    pub latched: u64,
    pub forwarded: u64,
}

pub struct FrameConsumerLoop<S> {
    state: LoopState,
    texture: TextureId,
    stream: S,
    signal: Arc<FrameAvailabilitySignal>,
    encoder: Arc<EncoderBinding>,
    sampling: Mat4,
    mvp: Mat4,
    pacer: Pacer,
    stats: LoopStats,
}

impl<S> FrameConsumerLoop<S> {
    pub fn new(
        texture: TextureId,
        stream: S,
        signal: Arc<FrameAvailabilitySignal>,
        encoder: Arc<EncoderBinding>,
        pacing: EncoderPacing,
    ) -> Self {
        Self {
            state: LoopState::Uninitialized,
            texture,
            stream,
            signal,
            encoder,
            sampling: Mat4::IDENTITY,
            mvp: Mat4::IDENTITY,
            pacer: Pacer::new(pacing),
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn texture(&self) -> TextureId {
        self.texture
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn mvp(&self) -> Mat4 {
        self.mvp
    }

    pub fn sampling(&self) -> Mat4 {
        self.sampling
    }

    /// Builds the drawer. A failure here is a startup failure, not a frame
    /// error.
    pub fn init<G: Gpu + ?Sized>(&mut self, gpu: &mut G) -> Result<()> {
        assert_eq!(
            self.state,
            LoopState::Uninitialized,
            "consumer loop initialized twice"
        );
        gpu.init_drawer()?;
        self.state = LoopState::Ready;
        tracing::debug!(texture = self.texture.0, "consumer loop ready");
        Ok(())
    }

    pub fn apply_transform<G: Gpu + ?Sized>(&mut self, gpu: &mut G, transform: &Transform) {
        assert_ne!(
            self.state,
            LoopState::Destroyed,
            "transform applied to a destroyed consumer loop"
        );
        gpu.set_viewport(transform.viewport);
        gpu.clear();
        self.mvp = transform.mvp;
    }

    pub fn draw<G>(&mut self, gpu: &mut G) -> TickReport
    where
        G: Gpu + ?Sized,
        S: ImageStream<G>,
    {
        assert_eq!(
            self.state,
            LoopState::Ready,
            "draw tick on a consumer loop that is not ready"
        );
        self.state = LoopState::Drawing;

        gpu.clear();

        let mut report = TickReport::default();
        if self.signal.drain() {
            if let Some(sampling) = self.stream.latch(gpu, self.texture) {
                self.sampling = sampling;
                report.latched = true;
            }
        }

        gpu.draw(self.texture, &self.sampling, &self.mvp);

        if self.pacer.admit(Instant::now()) {
            report.forwarded = self.encoder.forward(
                gpu.sharing_context(),
                self.texture,
                &self.sampling,
                &self.mvp,
            );
        }

        self.stats.ticks += 1;
        self.stats.latched += u64::from(report.latched);
        self.stats.forwarded += u64::from(report.forwarded);
        tracing::trace!(
            latched = report.latched,
            forwarded = report.forwarded,
            "draw tick"
        );

        self.state = LoopState::Ready;
        report
    }

    /// Releases the drawer. The loop cannot draw afterwards.
    pub fn release<G: Gpu + ?Sized>(&mut self, gpu: &mut G) {
        if self.state == LoopState::Destroyed {
            return;
        }
        if self.state == LoopState::Ready {
            gpu.release_drawer();
        }
        self.state = LoopState::Destroyed;
        tracing::debug!(
            ticks = self.stats.ticks,
            latched = self.stats.latched,
            forwarded = self.stats.forwarded,
            "consumer loop released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{EncoderSink, FrameCounter};
    use crate::testing::{Event, EventLog, RecordingGpu, ScriptedStream};
    use crate::transform::{compute, ContentGeometry, Rotation, ScaleMode, ViewGeometry};

    struct Fixture {
        log: EventLog,
        gpu: RecordingGpu,
        signal: Arc<FrameAvailabilitySignal>,
        encoder: Arc<EncoderBinding>,
        consumer: FrameConsumerLoop<ScriptedStream>,
    }

    fn fixture(pacing: EncoderPacing) -> Fixture {
        let log = EventLog::default();
        let mut gpu = RecordingGpu::new(log.clone());
        let texture = gpu.create_external_texture().expect("texture");
        let signal = Arc::new(FrameAvailabilitySignal::new());
        let encoder = Arc::new(EncoderBinding::new());
        let stream = ScriptedStream::new(log.clone(), flip_y());
        let mut consumer =
            FrameConsumerLoop::new(texture, stream, signal.clone(), encoder.clone(), pacing);
        consumer.init(&mut gpu).expect("drawer");
        log.clear();
        Fixture {
            log,
            gpu,
            signal,
            encoder,
            consumer,
        }
    }

    fn flip_y() -> Mat4 {
        Mat4::from_cols_array(&[
            1.0, 0.0, 0.0, 0.0, //
            0.0, -1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 1.0, 0.0, 1.0,
        ])
    }

    fn bind_counter(encoder: &EncoderBinding) -> Arc<FrameCounter> {
        let counter = Arc::new(FrameCounter::new());
        let sink: Arc<dyn EncoderSink> = counter.clone();
        encoder.bind(&sink);
        counter
    }

    #[test]
    fn tick_clears_latches_then_draws() {
        let mut f = fixture(EncoderPacing::Alternate);
        f.signal.signal();
        let report = f.consumer.draw(&mut f.gpu);
        assert!(report.latched);

        let events = f.log.snapshot();
        let texture = f.consumer.texture();
        assert_eq!(events[0], Event::Clear);
        assert_eq!(events[1], Event::Latch(texture));
        assert!(matches!(events[2], Event::Draw { sampling, .. } if sampling == flip_y()));
    }

    #[test]
    fn stale_frame_is_redrawn_without_latching() {
        let mut f = fixture(EncoderPacing::Alternate);
        let report = f.consumer.draw(&mut f.gpu);
        assert!(!report.latched);
        assert_eq!(f.log.count(|e| matches!(e, Event::Latch(_))), 0);
        assert_eq!(f.log.count(|e| matches!(e, Event::Draw { .. })), 1);
        assert_eq!(f.consumer.sampling(), Mat4::IDENTITY);
    }

    #[test]
    fn coalesced_signals_latch_once() {
        let mut f = fixture(EncoderPacing::Alternate);
        for _ in 0..3 {
            f.signal.signal();
        }
        assert!(f.consumer.draw(&mut f.gpu).latched);
        assert!(!f.consumer.draw(&mut f.gpu).latched);
        assert_eq!(f.log.count(|e| matches!(e, Event::Latch(_))), 1);
    }

    #[test]
    fn encoder_receives_every_other_tick() {
        for ticks in [1u64, 2, 3, 7, 60] {
            let mut f = fixture(EncoderPacing::Alternate);
            let counter = bind_counter(&f.encoder);
            for _ in 0..ticks {
                f.consumer.draw(&mut f.gpu);
            }
            assert_eq!(counter.frames(), ticks / 2, "ticks = {ticks}");
            assert_eq!(f.consumer.stats().forwarded, ticks / 2);
        }
    }

    #[test]
    fn encoder_gets_the_transforms_just_drawn() {
        let mut f = fixture(EncoderPacing::Alternate);
        let counter = bind_counter(&f.encoder);
        let view = ViewGeometry::new(1920, 1080);
        let transform = compute(
            view,
            ContentGeometry::new(640, 480, Rotation::Deg0),
            ScaleMode::CropCenter,
        );
        f.consumer.apply_transform(&mut f.gpu, &transform);
        f.consumer.draw(&mut f.gpu);
        f.signal.signal();
        f.consumer.draw(&mut f.gpu);

        let (sampling, mvp) = counter.last_stamps().expect("frame forwarded");
        assert_eq!(sampling, flip_y());
        assert_eq!(mvp, transform.mvp);
        assert_eq!(counter.handshakes(), 1);
    }

    #[test]
    fn unbound_encoder_is_skipped() {
        let mut f = fixture(EncoderPacing::Alternate);
        for _ in 0..4 {
            assert!(!f.consumer.draw(&mut f.gpu).forwarded);
        }
    }

    #[test]
    fn interval_pacing_limits_by_time() {
        let mut f = fixture(EncoderPacing::MinInterval { millis: 3_600_000 });
        let counter = bind_counter(&f.encoder);
        for _ in 0..10 {
            f.consumer.draw(&mut f.gpu);
        }
        assert_eq!(counter.frames(), 1);

        let mut f = fixture(EncoderPacing::MinInterval { millis: 0 });
        let counter = bind_counter(&f.encoder);
        for _ in 0..10 {
            f.consumer.draw(&mut f.gpu);
        }
        assert_eq!(counter.frames(), 10);
    }

    #[test]
    fn apply_transform_sets_viewport() {
        let mut f = fixture(EncoderPacing::Alternate);
        let view = ViewGeometry::new(1920, 1080);
        let transform = compute(
            view,
            ContentGeometry::new(640, 480, Rotation::Deg0),
            ScaleMode::KeepAspectViewport,
        );
        f.consumer.apply_transform(&mut f.gpu, &transform);
        assert_eq!(f.log.snapshot()[0], Event::Viewport(transform.viewport));
    }

    #[test]
    #[should_panic(expected = "not ready")]
    fn draw_after_release_is_a_contract_violation() {
        let mut f = fixture(EncoderPacing::Alternate);
        f.consumer.release(&mut f.gpu);
        assert_eq!(f.consumer.state(), LoopState::Destroyed);
        f.consumer.draw(&mut f.gpu);
    }

    #[test]
    #[should_panic(expected = "not ready")]
    fn draw_before_init_is_a_contract_violation() {
        let log = EventLog::default();
        let mut gpu = RecordingGpu::new(log.clone());
        let mut consumer = FrameConsumerLoop::new(
            TextureId(1),
            ScriptedStream::new(log, Mat4::IDENTITY),
            Arc::new(FrameAvailabilitySignal::new()),
            Arc::new(EncoderBinding::new()),
            EncoderPacing::Alternate,
        );
        consumer.draw(&mut gpu);
    }

    #[test]
    fn release_is_idempotent() {
        let mut f = fixture(EncoderPacing::Alternate);
        f.consumer.release(&mut f.gpu);
        f.consumer.release(&mut f.gpu);
        assert_eq!(f.log.count(|e| *e == Event::ReleaseDrawer), 1);
    }
}
