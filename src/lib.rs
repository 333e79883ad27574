//! Zero-copy live preview of a wlroots output.
//!
//! A producer thread exports output buffers as dmabufs; the render thread
//! latches the newest one into an external-image texture, draws it scaled
//! to the preview surface and optionally forwards every other frame to an
//! encoder sharing the same texture.

pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod lifecycle;
pub mod producer;
pub mod render;
pub mod signal;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transform;
pub mod wayland;

pub use config::PreviewConfig;
pub use encoder::{EncoderBinding, EncoderSink, FrameCounter, SharingContext};
pub use error::{Error, Result};
pub use lifecycle::{SurfaceLifecycleController, SurfaceState};
pub use producer::{NegotiatedFormat, Producer, ProducerLink, SourceSelector, StartRequest};
pub use signal::FrameAvailabilitySignal;
pub use transform::{ContentGeometry, Rotation, ScaleMode, Transform, ViewGeometry, Viewport};
