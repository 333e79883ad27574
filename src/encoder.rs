//! Encoder tap. The renderer forwards stamped frame references to an
//! [`EncoderSink`] living outside this crate; the sink samples the same
//! texture from its own EGL context.

use glam::Mat4;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::render::TextureId;

/// Raw EGL context handle the sink shares textures with. Only meaningful on
/// the render thread that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharingContext(usize);

impl SharingContext {
    pub const NONE: SharingContext = SharingContext(0);

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr as usize)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

pub trait EncoderSink: Send + Sync {
    /// Called on the render thread once per binding, before the first frame.
    fn set_sharing_context(&self, context: SharingContext, texture: TextureId);

    /// Called on the render thread. Implementations copy or queue and return.
    fn on_frame_available(&self, sampling: &Mat4, mvp: &Mat4);
}

#[derive(Default)]
struct BindingState {
    sink: Option<Weak<dyn EncoderSink>>,
    handshake_pending: bool,
}

/// Weak, replaceable link from the renderer to its encoder. Safe to bind and
/// unbind from any thread while draw ticks are in flight.
#[derive(Default)]
pub struct EncoderBinding {
    state: Mutex<BindingState>,
}

impl EncoderBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, sink: &Arc<dyn EncoderSink>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sink = Some(Arc::downgrade(sink));
        state.handshake_pending = true;
        tracing::info!("encoder sink bound");
    }

    pub fn unbind(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sink.take().is_some() {
            tracing::info!("encoder sink unbound");
        }
        state.handshake_pending = false;
    }

    pub fn is_bound(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .sink
            .as_ref()
            .is_some_and(|sink| sink.strong_count() > 0)
    }

    /// The texture changed underneath the sink; repeat the sharing handshake
    /// before the next forwarded frame.
    pub(crate) fn rearm(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sink.is_some() {
            state.handshake_pending = true;
        }
    }

    /// Hands one frame to the bound sink. Returns false when nothing is bound.
    pub(crate) fn forward(
        &self,
        context: SharingContext,
        texture: TextureId,
        sampling: &Mat4,
        mvp: &Mat4,
    ) -> bool {
        let (sink, handshake) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sink) = state.sink.as_ref().and_then(Weak::upgrade) else {
                if state.sink.take().is_some() {
                    tracing::debug!("encoder sink dropped, unbinding");
                }
                return false;
            };
            (sink, std::mem::take(&mut state.handshake_pending))
        };
        // sinks may bind or unbind from inside these callbacks
        if handshake {
            sink.set_sharing_context(context, texture);
        }
        sink.on_frame_available(sampling, mvp);
        true
    }
}

/// Sink that only counts frames and remembers the last stamps it saw.
#[derive(Debug, Default)]
pub struct FrameCounter {
    frames: AtomicU64,
    handshakes: AtomicU64,
    last: Mutex<Option<(Mat4, Mat4)>>,
}

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn handshakes(&self) -> u64 {
        self.handshakes.load(Ordering::Relaxed)
    }

    pub fn last_stamps(&self) -> Option<(Mat4, Mat4)> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EncoderSink for FrameCounter {
    fn set_sharing_context(&self, context: SharingContext, texture: TextureId) {
        tracing::debug!(context = ?context, texture = texture.0, "encoder sharing context");
        self.handshakes.fetch_add(1, Ordering::Relaxed);
    }

    fn on_frame_available(&self, sampling: &Mat4, mvp: &Mat4) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some((*sampling, *mvp));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(binding: &EncoderBinding) -> bool {
        binding.forward(
            SharingContext::NONE,
            TextureId(7),
            &Mat4::IDENTITY,
            &Mat4::IDENTITY,
        )
    }

    #[test]
    fn unbound_binding_drops_frames() {
        let binding = EncoderBinding::new();
        assert!(!binding.is_bound());
        assert!(!forward(&binding));
    }

    #[test]
    fn handshake_happens_once_per_bind() {
        let counter = Arc::new(FrameCounter::new());
        let sink: Arc<dyn EncoderSink> = counter.clone();
        let binding = EncoderBinding::new();
        binding.bind(&sink);

        assert!(forward(&binding));
        assert!(forward(&binding));
        assert_eq!(counter.handshakes(), 1);
        assert_eq!(counter.frames(), 2);

        binding.rearm();
        assert!(forward(&binding));
        assert_eq!(counter.handshakes(), 2);
    }

    #[test]
    fn handshake_waits_for_the_first_forwarded_frame() {
        let counter = Arc::new(FrameCounter::new());
        let sink: Arc<dyn EncoderSink> = counter.clone();
        let binding = EncoderBinding::new();
        binding.bind(&sink);
        binding.rearm();
        assert_eq!(counter.handshakes(), 0);

        assert!(forward(&binding));
        assert_eq!(counter.handshakes(), 1);
        assert_eq!(counter.frames(), 1);
    }

    #[test]
    fn dropped_sink_counts_as_unbound() {
        let binding = EncoderBinding::new();
        {
            let sink: Arc<dyn EncoderSink> = Arc::new(FrameCounter::new());
            binding.bind(&sink);
            assert!(binding.is_bound());
        }
        assert!(!binding.is_bound());
        assert!(!forward(&binding));
    }

    #[test]
    fn unbind_stops_forwarding() {
        let counter = Arc::new(FrameCounter::new());
        let sink: Arc<dyn EncoderSink> = counter.clone();
        let binding = EncoderBinding::new();
        binding.bind(&sink);
        assert!(forward(&binding));
        binding.unbind();
        assert!(!forward(&binding));
        assert_eq!(counter.frames(), 1);
    }

    /// Detaches itself after the first frame, the way an encoder does on
    /// end of stream.
    struct OneShotSink {
        binding: Arc<EncoderBinding>,
        frames: AtomicU64,
    }

    impl EncoderSink for OneShotSink {
        fn set_sharing_context(&self, _context: SharingContext, _texture: TextureId) {
            assert!(self.binding.is_bound());
        }

        fn on_frame_available(&self, _sampling: &Mat4, _mvp: &Mat4) {
            self.frames.fetch_add(1, Ordering::Relaxed);
            self.binding.unbind();
        }
    }

    #[test]
    fn sink_can_unbind_from_its_own_callback() {
        let binding = Arc::new(EncoderBinding::new());
        let one_shot = Arc::new(OneShotSink {
            binding: binding.clone(),
            frames: AtomicU64::new(0),
        });
        let sink: Arc<dyn EncoderSink> = one_shot.clone();
        binding.bind(&sink);

        assert!(forward(&binding));
        assert!(!binding.is_bound());
        assert!(!forward(&binding));
        assert_eq!(one_shot.frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rearm_without_sink_is_noop() {
        let binding = EncoderBinding::new();
        binding.rearm();
        assert!(!binding.is_bound());
    }
}
