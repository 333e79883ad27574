//! Render-surface lifecycle. Owns the external texture and decides when the
//! producer and the consumer loop may run.

use std::sync::Arc;

use crate::config::PreviewConfig;
use crate::encoder::{EncoderBinding, EncoderSink};
use crate::error::{Error, Result};
use crate::producer::{NegotiatedFormat, Producer, ProducerLink, SourceSelector, StartRequest};
use crate::render::{
    EncoderPacing, FrameConsumerLoop, Gpu, LoopStats, TextureId, TickReport,
    EXTERNAL_IMAGE_EXTENSION,
};
use crate::signal::FrameAvailabilitySignal;
use crate::transform::{self, ContentGeometry, ScaleMode, Transform, ViewGeometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    NoSurface,
    SurfaceCreated,
    SurfaceSized,
}

struct LiveSurface<S> {
    texture: TextureId,
    consumer: FrameConsumerLoop<S>,
}

pub struct SurfaceLifecycleController<G, P>
where
    G: Gpu,
    P: Producer<G>,
{
    gpu: G,
    producer: P,
    state: SurfaceState,
    view: ViewGeometry,
    content: ContentGeometry,
    scale_mode: ScaleMode,
    transform: Transform,
    source: SourceSelector,
    clear_color: [f32; 4],
    pacing: EncoderPacing,
    signal: Arc<FrameAvailabilitySignal>,
    link: Arc<ProducerLink>,
    encoder: Arc<EncoderBinding>,
    surface: Option<LiveSurface<P::Stream>>,
}

impl<G, P> SurfaceLifecycleController<G, P>
where
    G: Gpu,
    P: Producer<G>,
{
    pub fn new(gpu: G, producer: P, config: &PreviewConfig) -> Self {
        let signal = Arc::new(FrameAvailabilitySignal::new());
        let link = Arc::new(ProducerLink::new(signal.clone()));
        let content = config
            .content
            .map(|content| content.geometry())
            .unwrap_or_default();
        Self {
            gpu,
            producer,
            state: SurfaceState::NoSurface,
            view: ViewGeometry::default(),
            content,
            scale_mode: config.scale_mode,
            transform: Transform::identity(ViewGeometry::default()),
            source: SourceSelector::default(),
            clear_color: config.clear_color,
            pacing: config.encoder_pacing,
            signal,
            link,
            encoder: Arc::new(EncoderBinding::new()),
            surface: None,
        }
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn view(&self) -> ViewGeometry {
        self.view
    }

    pub fn content(&self) -> ContentGeometry {
        self.content
    }

    pub fn scale_mode(&self) -> ScaleMode {
        self.scale_mode
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn source(&self) -> SourceSelector {
        self.source
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.surface.as_ref().map(|surface| surface.texture)
    }

    pub fn signal(&self) -> &Arc<FrameAvailabilitySignal> {
        &self.signal
    }

    pub fn stats(&self) -> Option<LoopStats> {
        self.surface.as_ref().map(|surface| surface.consumer.stats())
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// The GL surface exists and its context is current.
    pub fn surface_created(&mut self) -> Result<()> {
        if self.surface.is_some() {
            tracing::warn!("surface created twice without destroy, tearing down the old one");
            self.surface_destroyed();
        }

        if !self.gpu.has_extension(EXTERNAL_IMAGE_EXTENSION) {
            return Err(Error::MissingExtension(EXTERNAL_IMAGE_EXTENSION));
        }

        let texture = self.gpu.create_external_texture()?;
        self.signal.reset();
        let stream = match self.producer.bind(texture, self.link.clone()) {
            Ok(stream) => stream,
            Err(e) => {
                self.gpu.delete_texture(texture);
                return Err(e);
            }
        };

        self.gpu.set_clear_color(self.clear_color);
        let mut consumer = FrameConsumerLoop::new(
            texture,
            stream,
            self.signal.clone(),
            self.encoder.clone(),
            self.pacing,
        );
        if let Err(e) = consumer.init(&mut self.gpu) {
            self.gpu.delete_texture(texture);
            return Err(e);
        }

        self.transform = Transform::identity(self.view);
        self.encoder.rearm();
        self.surface = Some(LiveSurface { texture, consumer });
        self.state = SurfaceState::SurfaceCreated;
        tracing::info!(texture = texture.0, "preview surface created");
        Ok(())
    }

    /// The surface got its (new) size. Zero sizes mean layout is still in
    /// progress and are ignored.
    pub fn surface_changed(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            tracing::debug!(width, height, "ignoring empty surface size");
            return;
        }
        if self.surface.is_none() {
            tracing::warn!(width, height, "surface size reported without a surface");
            return;
        }

        self.view = ViewGeometry::new(width, height);
        self.state = SurfaceState::SurfaceSized;
        self.update_transform();
        tracing::info!(width, height, "preview surface sized");
        self.start_producer();
    }

    /// The surface is about to go away. Blocks until the producer has fully
    /// stopped, then releases GPU resources.
    pub fn surface_destroyed(&mut self) {
        self.producer.stop(true);
        if let Some(mut surface) = self.surface.take() {
            surface.consumer.release(&mut self.gpu);
            drop(surface.consumer);
            self.gpu.delete_texture(surface.texture);
            tracing::info!(texture = surface.texture.0, "preview surface destroyed");
        }
        self.state = SurfaceState::NoSurface;
    }

    /// Backgrounded: ask the producer to stop without waiting for it.
    pub fn pause(&mut self) {
        tracing::info!("pausing producer");
        self.producer.stop(false);
    }

    pub fn resume(&mut self) {
        if self.state != SurfaceState::SurfaceSized {
            tracing::debug!(state = ?self.state, "resume without a sized surface");
            return;
        }
        if self.producer.is_running() {
            return;
        }
        tracing::info!("resuming producer");
        self.start_producer();
    }

    /// Switch to the next producer source, keeping the current view size.
    pub fn toggle_source(&mut self) {
        self.source = self.source.cycle(self.producer.source_count());
        tracing::info!(source = self.source.0, "switching producer source");
        self.producer.stop(true);
        if self.state == SurfaceState::SurfaceSized {
            self.start_producer();
        }
    }

    pub fn set_scale_mode(&mut self, mode: ScaleMode) {
        if self.scale_mode != mode {
            self.scale_mode = mode;
            self.update_transform();
        }
    }

    /// Set the content size as delivered by the producer; `rotation_degrees`
    /// is applied before the size is interpreted.
    pub fn set_content_size(&mut self, width: u32, height: u32, rotation_degrees: i32) {
        let content = ContentGeometry::new(
            width,
            height,
            transform::Rotation::from_degrees(rotation_degrees),
        );
        if self.content != content {
            self.content = content;
            self.update_transform();
        }
    }

    pub fn bind_encoder(&mut self, sink: &Arc<dyn EncoderSink>) {
        self.encoder.bind(sink);
    }

    pub fn unbind_encoder(&mut self) {
        self.encoder.unbind();
    }

    /// Handle for binding the encoder from another thread.
    pub fn encoder_binding(&self) -> Arc<EncoderBinding> {
        self.encoder.clone()
    }

    /// One scheduled draw. Returns `None` while there is no surface.
    pub fn draw_frame(&mut self) -> Option<TickReport> {
        if let Some(format) = self.link.take_format() {
            self.apply_negotiated(format);
        }
        let surface = self.surface.as_mut()?;
        Some(surface.consumer.draw(&mut self.gpu))
    }

    fn apply_negotiated(&mut self, format: NegotiatedFormat) {
        tracing::debug!(
            width = format.width,
            height = format.height,
            rotation = format.rotation.degrees(),
            "producer negotiated format"
        );
        let content = ContentGeometry::new(format.width, format.height, format.rotation);
        if self.content != content {
            self.content = content;
            self.update_transform();
        }
    }

    fn update_transform(&mut self) {
        self.transform = transform::compute(self.view, self.content, self.scale_mode);
        tracing::debug!(
            view = ?self.view,
            content = ?self.content,
            mode = ?self.scale_mode,
            viewport = ?self.transform.viewport,
            "transform updated"
        );
        if let Some(surface) = self.surface.as_mut() {
            surface.consumer.apply_transform(&mut self.gpu, &self.transform);
        }
    }

    fn start_producer(&mut self) {
        let request = StartRequest {
            width: self.view.width,
            height: self.view.height,
            source: self.source,
        };
        tracing::info!(
            width = request.width,
            height = request.height,
            source = request.source.0,
            "starting producer"
        );
        self.producer.start(request);
    }
}

impl<G, P> Drop for SurfaceLifecycleController<G, P>
where
    G: Gpu,
    P: Producer<G>,
{
    fn drop(&mut self) {
        if self.surface.is_some() {
            self.surface_destroyed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, EventLog, RecordingGpu, ScriptedProducer};
    use crate::transform::{Rotation, Viewport};
    use std::time::Duration;

    type Controller = SurfaceLifecycleController<RecordingGpu, ScriptedProducer>;

    fn running(c: &Controller) -> bool {
        Producer::<RecordingGpu>::is_running(c.producer())
    }

    fn controller(log: &EventLog) -> Controller {
        SurfaceLifecycleController::new(
            RecordingGpu::new(log.clone()),
            ScriptedProducer::new(log.clone()),
            &PreviewConfig::default(),
        )
    }

    #[test]
    fn missing_extension_is_fatal() {
        let log = EventLog::default();
        let mut c = SurfaceLifecycleController::new(
            RecordingGpu::without_external_images(log.clone()),
            ScriptedProducer::new(log.clone()),
            &PreviewConfig::default(),
        );
        let err = c.surface_created().unwrap_err();
        assert!(matches!(err, Error::MissingExtension(EXTERNAL_IMAGE_EXTENSION)));
        assert_eq!(c.state(), SurfaceState::NoSurface);
        assert_eq!(log.count(|e| matches!(e, Event::CreateTexture(_))), 0);
        assert!(c.draw_frame().is_none());
    }

    #[test]
    fn drawer_failure_releases_texture() {
        let log = EventLog::default();
        let mut c = SurfaceLifecycleController::new(
            RecordingGpu::new(log.clone()).with_failing_drawer(),
            ScriptedProducer::new(log.clone()),
            &PreviewConfig::default(),
        );
        assert!(matches!(c.surface_created(), Err(Error::Drawer(_))));
        let created = log
            .position(|e| matches!(e, Event::CreateTexture(_)))
            .expect("texture created");
        let deleted = log
            .position(|e| matches!(e, Event::DeleteTexture(_)))
            .expect("texture deleted");
        assert!(created < deleted);
        assert!(c.texture().is_none());
    }

    #[test]
    fn create_binds_producer_and_resets_transform() {
        let log = EventLog::default();
        let mut c = controller(&log);
        c.signal().signal();
        c.surface_created().unwrap();

        let texture = c.texture().expect("texture");
        assert_eq!(c.state(), SurfaceState::SurfaceCreated);
        assert!(log.position(|e| *e == Event::Bind(texture)).is_some());
        assert!(!c.signal().is_pending());
        assert_eq!(c.transform().mvp, glam::Mat4::IDENTITY);
        assert!(!running(&c));
    }

    #[test]
    fn zero_sizes_are_ignored() {
        let log = EventLog::default();
        let mut c = controller(&log);
        c.surface_created().unwrap();
        c.surface_changed(0, 1080);
        c.surface_changed(1920, 0);
        assert_eq!(c.state(), SurfaceState::SurfaceCreated);
        assert_eq!(log.count(|e| matches!(e, Event::Start(_))), 0);
    }

    #[test]
    fn size_starts_producer_at_view_size() {
        let log = EventLog::default();
        let mut c = controller(&log);
        c.surface_created().unwrap();
        c.surface_changed(1920, 1080);

        assert_eq!(c.state(), SurfaceState::SurfaceSized);
        assert_eq!(c.view(), ViewGeometry::new(1920, 1080));
        assert!(log
            .position(|e| *e
                == Event::Start(StartRequest {
                    width: 1920,
                    height: 1080,
                    source: SourceSelector(0),
                }))
            .is_some());
        assert!(running(&c));
        c.surface_destroyed();
    }

    #[test]
    fn negotiated_format_is_rotated_by_the_core() {
        let log = EventLog::default();
        let mut c = SurfaceLifecycleController::new(
            RecordingGpu::new(log.clone()),
            ScriptedProducer::new(log.clone()).negotiating(1280, 720, Rotation::Deg90),
            &PreviewConfig::default(),
        );
        c.surface_created().unwrap();
        c.surface_changed(1080, 1920);
        c.draw_frame().expect("surface is live");

        assert_eq!(c.content().oriented(), (720, 1280));
        // 720x1280 content scaled by max(1.5, 1.5) fills 1080x1920 exactly
        assert!(c
            .transform()
            .mvp
            .abs_diff_eq(glam::Mat4::IDENTITY, 1e-5));
        c.surface_destroyed();
    }

    #[test]
    fn scale_mode_change_reapplies_viewport() {
        let log = EventLog::default();
        let mut c = controller(&log);
        c.surface_created().unwrap();
        c.set_content_size(640, 480, 0);
        c.surface_changed(1920, 1080);
        log.clear();

        c.set_scale_mode(ScaleMode::KeepAspectViewport);
        let expected = Viewport {
            x: 240,
            y: 0,
            width: 1440,
            height: 1080,
        };
        assert_eq!(c.transform().viewport, expected);
        assert!(log.position(|e| *e == Event::Viewport(expected)).is_some());

        log.clear();
        c.set_scale_mode(ScaleMode::KeepAspectViewport);
        assert_eq!(log.count(|e| matches!(e, Event::Viewport(_))), 0);
        c.surface_destroyed();
    }

    #[test]
    fn destroy_waits_for_producer_before_releasing_texture() {
        let log = EventLog::default();
        let mut c = controller(&log);
        c.surface_created().unwrap();
        c.surface_changed(1280, 720);
        c.surface_destroyed();

        let stopped = log.position(|e| *e == Event::Stopped).expect("producer stopped");
        let released = log.position(|e| *e == Event::ReleaseDrawer).expect("drawer released");
        let deleted = log
            .position(|e| matches!(e, Event::DeleteTexture(_)))
            .expect("texture deleted");
        assert!(stopped < released);
        assert!(released < deleted);
        assert_eq!(c.state(), SurfaceState::NoSurface);
        assert!(c.draw_frame().is_none());
    }

    #[test]
    fn pause_does_not_wait_and_resume_restarts() {
        let log = EventLog::default();
        let mut c = controller(&log);
        c.surface_created().unwrap();
        c.surface_changed(1280, 720);

        c.pause();
        assert!(log
            .position(|e| *e == Event::StopRequested { wait: false })
            .is_some());
        assert!(!running(&c));

        c.resume();
        assert!(running(&c));
        assert_eq!(log.count(|e| matches!(e, Event::Start(_))), 2);

        // already running: no second start
        c.resume();
        assert_eq!(log.count(|e| matches!(e, Event::Start(_))), 2);
        c.surface_destroyed();
    }

    #[test]
    fn destroy_after_pause_still_waits_for_producer() {
        let log = EventLog::default();
        let mut c = SurfaceLifecycleController::new(
            RecordingGpu::new(log.clone()),
            ScriptedProducer::new(log.clone()).with_stop_delay(Duration::from_millis(50)),
            &PreviewConfig::default(),
        );
        c.surface_created().unwrap();
        c.surface_changed(1280, 720);
        let texture = c.texture().expect("texture");

        c.pause();
        c.surface_destroyed();

        let stopped = log.position(|e| *e == Event::Stopped).expect("producer stopped");
        let released = log
            .position(|e| *e == Event::ReleaseDrawer)
            .expect("drawer released");
        let deleted = log
            .position(|e| *e == Event::DeleteTexture(texture))
            .expect("texture deleted");
        assert!(stopped < released, "drawer released while producer thread ran");
        assert!(released < deleted);
    }

    #[test]
    fn resume_without_surface_is_noop() {
        let log = EventLog::default();
        let mut c = controller(&log);
        c.resume();
        c.surface_created().unwrap();
        c.resume();
        assert_eq!(log.count(|e| matches!(e, Event::Start(_))), 0);
    }

    #[test]
    fn toggle_source_restarts_with_previous_size() {
        let log = EventLog::default();
        let mut c = controller(&log);
        c.surface_created().unwrap();
        c.surface_changed(1280, 720);
        c.toggle_source();

        assert_eq!(c.source(), SourceSelector(1));
        let stop = log
            .position(|e| *e == Event::StopRequested { wait: true })
            .expect("stop requested");
        let stopped = log.position(|e| *e == Event::Stopped).expect("stopped");
        let restart = log
            .position(|e| {
                *e == Event::Start(StartRequest {
                    width: 1280,
                    height: 720,
                    source: SourceSelector(1),
                })
            })
            .expect("restarted");
        assert!(stop < stopped);
        assert!(stopped < restart);

        c.toggle_source();
        assert_eq!(c.source(), SourceSelector(0));
        c.surface_destroyed();
    }

    #[test]
    fn encoder_handshake_repeats_after_recreate() {
        use crate::encoder::FrameCounter;

        let log = EventLog::default();
        let mut c = controller(&log);
        let counter = Arc::new(FrameCounter::new());
        let sink: Arc<dyn EncoderSink> = counter.clone();
        c.bind_encoder(&sink);

        c.surface_created().unwrap();
        c.surface_changed(640, 480);
        for _ in 0..4 {
            c.draw_frame();
        }
        c.surface_destroyed();
        c.surface_created().unwrap();
        c.surface_changed(640, 480);
        for _ in 0..4 {
            c.draw_frame();
        }
        assert_eq!(counter.frames(), 4);
        assert_eq!(counter.handshakes(), 2);

        c.unbind_encoder();
        for _ in 0..4 {
            c.draw_frame();
        }
        assert_eq!(counter.frames(), 4);
    }

    #[test]
    fn drop_tears_down_live_surface() {
        let log = EventLog::default();
        {
            let mut c = controller(&log);
            c.surface_created().unwrap();
            c.surface_changed(1280, 720);
        }
        let stopped = log.position(|e| *e == Event::Stopped).expect("stopped");
        let deleted = log
            .position(|e| matches!(e, Event::DeleteTexture(_)))
            .expect("deleted");
        assert!(stopped < deleted);
    }
}
