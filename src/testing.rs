//! Recording doubles for the GPU and the producer.
//!
//! Available behind the `test-util` feature or in `#[cfg(test)]`. Every call
//! lands in a shared [`EventLog`] so tests can assert on ordering across the
//! render thread and the producer thread.

use glam::Mat4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::encoder::SharingContext;
use crate::error::{Error, Result};
use crate::producer::{NegotiatedFormat, Producer, ProducerLink, StartRequest};
use crate::render::{Gpu, ImageStream, TextureId, EXTERNAL_IMAGE_EXTENSION};
use crate::transform::{Rotation, Viewport};

/// Initialise a tracing subscriber for tests. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CreateTexture(TextureId),
    DeleteTexture(TextureId),
    InitDrawer,
    ReleaseDrawer,
    ClearColor([f32; 4]),
    Viewport(Viewport),
    Clear,
    Draw {
        texture: TextureId,
        sampling: Mat4,
        mvp: Mat4,
    },
    Bind(TextureId),
    Latch(TextureId),
    Start(StartRequest),
    StopRequested { wait: bool },
    /// Pushed by the producer thread as the very last thing it does.
    Stopped,
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.snapshot().iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.snapshot().iter().filter(|e| pred(e)).count()
    }
}

pub struct RecordingGpu {
    log: EventLog,
    extensions: String,
    next_texture: u32,
    fail_drawer: bool,
}

impl RecordingGpu {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            extensions: format!("GL_OES_EGL_image GL_{EXTERNAL_IMAGE_EXTENSION} GL_EXT_texture_format_BGRA8888"),
            next_texture: 1,
            fail_drawer: false,
        }
    }

    /// A context lacking external-image sampling.
    pub fn without_external_images(log: EventLog) -> Self {
        Self {
            extensions: "GL_OES_EGL_image GL_EXT_texture_format_BGRA8888".to_string(),
            ..Self::new(log)
        }
    }

    pub fn with_failing_drawer(mut self) -> Self {
        self.fail_drawer = true;
        self
    }
}

impl Gpu for RecordingGpu {
    fn extensions(&self) -> String {
        self.extensions.clone()
    }

    fn create_external_texture(&mut self) -> Result<TextureId> {
        let texture = TextureId(self.next_texture);
        self.next_texture += 1;
        self.log.push(Event::CreateTexture(texture));
        Ok(texture)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.log.push(Event::DeleteTexture(texture));
    }

    fn init_drawer(&mut self) -> Result<()> {
        if self.fail_drawer {
            return Err(Error::Drawer("shader compile failed".to_string()));
        }
        self.log.push(Event::InitDrawer);
        Ok(())
    }

    fn release_drawer(&mut self) {
        self.log.push(Event::ReleaseDrawer);
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.log.push(Event::ClearColor(rgba));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.log.push(Event::Viewport(viewport));
    }

    fn clear(&mut self) {
        self.log.push(Event::Clear);
    }

    fn draw(&mut self, texture: TextureId, sampling: &Mat4, mvp: &Mat4) {
        self.log.push(Event::Draw {
            texture,
            sampling: *sampling,
            mvp: *mvp,
        });
    }

    fn sharing_context(&self) -> SharingContext {
        SharingContext::NONE
    }
}

/// Stream that always latches successfully with a fixed sampling transform.
pub struct ScriptedStream {
    log: EventLog,
    sampling: Mat4,
}

impl ScriptedStream {
    pub fn new(log: EventLog, sampling: Mat4) -> Self {
        Self { log, sampling }
    }
}

impl<G: Gpu + ?Sized> ImageStream<G> for ScriptedStream {
    fn latch(&mut self, _gpu: &mut G, texture: TextureId) -> Option<Mat4> {
        self.log.push(Event::Latch(texture));
        Some(self.sampling)
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Producer double running a real thread that raises frame signals until it
/// is told to stop. It lingers for `stop_delay` after a stop request, so a
/// teardown that does not wait is observable in the log.
pub struct ScriptedProducer {
    log: EventLog,
    link: Option<Arc<ProducerLink>>,
    worker: Option<Worker>,
    detached: Vec<JoinHandle<()>>,
    sources: usize,
    negotiated: Option<NegotiatedFormat>,
    stop_delay: Duration,
    frame_interval: Duration,
}

impl ScriptedProducer {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            link: None,
            worker: None,
            detached: Vec::new(),
            sources: 2,
            negotiated: None,
            stop_delay: Duration::from_millis(20),
            frame_interval: Duration::from_millis(1),
        }
    }

    /// Report this format instead of echoing the requested size.
    pub fn negotiating(mut self, width: u32, height: u32, rotation: Rotation) -> Self {
        self.negotiated = Some(NegotiatedFormat {
            width,
            height,
            rotation,
        });
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }
}

impl<G: Gpu> Producer<G> for ScriptedProducer {
    type Stream = ScriptedStream;

    fn bind(&mut self, texture: TextureId, link: Arc<ProducerLink>) -> Result<ScriptedStream> {
        self.log.push(Event::Bind(texture));
        self.link = Some(link);
        Ok(ScriptedStream::new(self.log.clone(), Mat4::IDENTITY))
    }

    fn start(&mut self, request: StartRequest) {
        self.log.push(Event::Start(request));
        let Some(link) = self.link.clone() else {
            return;
        };
        link.report_format(self.negotiated.unwrap_or(NegotiatedFormat {
            width: request.width,
            height: request.height,
            rotation: Rotation::Deg0,
        }));
        if self.worker.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let log = self.log.clone();
        let flag = stop.clone();
        let stop_delay = self.stop_delay;
        let frame_interval = self.frame_interval;
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                link.frame_available();
                thread::sleep(frame_interval);
            }
            thread::sleep(stop_delay);
            log.push(Event::Stopped);
        });
        self.worker = Some(Worker { stop, handle });
    }

    fn stop(&mut self, wait: bool) {
        self.log.push(Event::StopRequested { wait });
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            self.detached.push(worker.handle);
        }
        if wait {
            // includes threads left behind by earlier non-waiting stops
            for handle in self.detached.drain(..) {
                let _ = handle.join();
            }
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    fn source_count(&self) -> usize {
        self.sources
    }
}

impl Drop for ScriptedProducer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            let _ = worker.handle.join();
        }
        for handle in self.detached.drain(..) {
            let _ = handle.join();
        }
    }
}
