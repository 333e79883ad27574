//! Boundary to the frame producer. The producer owns its own thread; the core
//! only starts it, stops it, and hands it a [`ProducerLink`] to report on.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::render::{Gpu, ImageStream, TextureId};
use crate::signal::FrameAvailabilitySignal;
use crate::transform::Rotation;

/// Which of the producer's sources to capture from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceSelector(pub usize);

impl SourceSelector {
    /// Next source, wrapping around `count` sources.
    pub fn cycle(self, count: usize) -> Self {
        if count == 0 {
            self
        } else {
            SourceSelector((self.0 + 1) % count)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartRequest {
    pub width: u32,
    pub height: u32,
    pub source: SourceSelector,
}

/// What the producer actually delivers, which may differ from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
}

/// Channel from the producer thread back to the render thread.
#[derive(Debug, Default)]
pub struct ProducerLink {
    signal: Arc<FrameAvailabilitySignal>,
    negotiated: Mutex<Option<NegotiatedFormat>>,
}

impl ProducerLink {
    pub fn new(signal: Arc<FrameAvailabilitySignal>) -> Self {
        Self {
            signal,
            negotiated: Mutex::new(None),
        }
    }

    /// Announce that a new image is ready to be latched.
    pub fn frame_available(&self) {
        self.signal.signal();
    }

    /// Publish the size and rotation the hardware settled on. Last report wins.
    pub fn report_format(&self, format: NegotiatedFormat) {
        *self.negotiated.lock().unwrap_or_else(PoisonError::into_inner) = Some(format);
    }

    pub(crate) fn take_format(&self) -> Option<NegotiatedFormat> {
        self.negotiated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn signal(&self) -> &Arc<FrameAvailabilitySignal> {
        &self.signal
    }
}

pub trait Producer<G: Gpu> {
    type Stream: ImageStream<G>;

    /// Attach the producer's output to a freshly allocated texture.
    fn bind(&mut self, texture: TextureId, link: Arc<ProducerLink>) -> Result<Self::Stream>;

    /// Start capturing. Calling this on a running producer re-targets it.
    fn start(&mut self, request: StartRequest);

    /// Request a stop; with `wait`, return only once the producer thread has
    /// fully terminated and will no longer touch the texture.
    fn stop(&mut self, wait: bool);

    /// True between `start` and the next `stop` request.
    fn is_running(&self) -> bool;

    fn source_count(&self) -> usize {
        1
    }
}
