pub mod consumer;
pub mod egl;
pub mod gles;
pub mod surface;

pub use consumer::{EncoderPacing, FrameConsumerLoop, LoopState, LoopStats, TickReport};
pub use egl::EglContext;
pub use gles::GlesGpu;
pub use surface::{Placement, PreviewSurface};

use glam::Mat4;

use crate::encoder::SharingContext;
use crate::error::Result;
use crate::transform::Viewport;

/// GL extension that lets the renderer sample producer images directly.
pub const EXTERNAL_IMAGE_EXTENSION: &str = "OES_EGL_image_external";

/// GL name of an external-image texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// The drawing surface as seen by the preview core. All calls happen on the
/// render thread with the context current.
pub trait Gpu {
    /// Space-separated extension string of the current context.
    fn extensions(&self) -> String;

    fn create_external_texture(&mut self) -> Result<TextureId>;

    fn delete_texture(&mut self, texture: TextureId);

    /// Builds the shader program and quad used by [`Gpu::draw`].
    fn init_drawer(&mut self) -> Result<()>;

    fn release_drawer(&mut self);

    fn set_clear_color(&mut self, rgba: [f32; 4]);

    fn set_viewport(&mut self, viewport: Viewport);

    fn clear(&mut self);

    fn draw(&mut self, texture: TextureId, sampling: &Mat4, mvp: &Mat4);

    /// Context an encoder may share `texture` with.
    fn sharing_context(&self) -> SharingContext;

    fn has_extension(&self, name: &str) -> bool {
        self.extensions().contains(name)
    }
}

/// Producer side of the shared texture: latches the newest producer image
/// into the texture on the render thread.
pub trait ImageStream<G: Gpu + ?Sized> {
    /// Returns the sampling transform of the latched image, or `None` when no
    /// image could be latched and the previous one stays on the texture.
    fn latch(&mut self, gpu: &mut G, texture: TextureId) -> Option<Mat4>;
}
