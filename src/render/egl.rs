use anyhow::{anyhow, bail, Context, Result};
use khronos_egl as egl;
use std::ffi::c_void;
use std::os::fd::AsRawFd;

use crate::capture::CapturedFrame;

// EGL_EXT_image_dma_buf_import(_modifiers)
const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: i32 = 0x3271;
const EGL_WIDTH: i32 = 0x3057;
const EGL_HEIGHT: i32 = 0x3056;
const EGL_NO_CONTEXT: *mut c_void = std::ptr::null_mut();

/// FD, OFFSET, PITCH, MODIFIER_LO, MODIFIER_HI per plane.
const PLANE_ATTRIBS: [[i32; 5]; 4] = [
    [0x3272, 0x3273, 0x3274, 0x3443, 0x3444],
    [0x3275, 0x3276, 0x3277, 0x3445, 0x3446],
    [0x3278, 0x3279, 0x327A, 0x3447, 0x3448],
    [0x3440, 0x3441, 0x3442, 0x3449, 0x344A],
];

const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

type CreateImageKhr =
    unsafe extern "C" fn(egl::EGLDisplay, *mut c_void, u32, *mut c_void, *const i32) -> *mut c_void;
type DestroyImageKhr = unsafe extern "C" fn(egl::EGLDisplay, *mut c_void) -> u32;
type ImageTargetTexture2dOes = unsafe extern "C" fn(u32, *mut c_void);

/// An EGLImage wrapping an imported dmabuf. Must be released through
/// [`EglContext::destroy_image`] on the thread owning the context.
#[derive(Debug)]
pub struct EglImage(*mut c_void);

struct ImageFns {
    create: CreateImageKhr,
    destroy: DestroyImageKhr,
    target_texture: ImageTargetTexture2dOes,
}

pub struct EglContext {
    pub egl: egl::DynamicInstance<egl::EGL1_5>,
    pub display: egl::Display,
    pub context: egl::Context,
    pub config: egl::Config,
    image_fns: Option<ImageFns>,
}

impl EglContext {
    pub fn new(wayland_display: *mut c_void) -> Result<Self> {
        let egl = unsafe { egl::DynamicInstance::<egl::EGL1_5>::load_required() }
            .context("Failed to load EGL")?;

        let display = unsafe { egl.get_display(wayland_display) }
            .ok_or_else(|| anyhow!("Failed to get EGL display"))?;

        let (major, minor) = egl.initialize(display).context("Failed to initialize EGL")?;
        tracing::debug!(major, minor, "EGL initialized");

        let config_attribs = [
            egl::SURFACE_TYPE,
            egl::WINDOW_BIT,
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::ALPHA_SIZE,
            8,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES2_BIT,
            egl::NONE,
        ];

        let config = egl
            .choose_first_config(display, &config_attribs)
            .context("Failed to choose EGL config")?
            .ok_or_else(|| anyhow!("No suitable EGL config found"))?;

        egl.bind_api(egl::OPENGL_ES_API)
            .context("Failed to bind OpenGL ES API")?;

        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
        let context = egl
            .create_context(display, config, None, &context_attribs)
            .context("Failed to create EGL context")?;

        let mut ctx = Self {
            egl,
            display,
            context,
            config,
            image_fns: None,
        };
        ctx.image_fns = ctx.load_image_fns();
        if ctx.image_fns.is_none() {
            tracing::warn!("EGL dmabuf import entry points not found");
        }
        Ok(ctx)
    }

    fn load_image_fns(&self) -> Option<ImageFns> {
        let create = self.egl.get_proc_address("eglCreateImageKHR")?;
        let destroy = self.egl.get_proc_address("eglDestroyImageKHR")?;
        let target_texture = self.egl.get_proc_address("glEGLImageTargetTexture2DOES")?;
        // SAFETY: signatures match EGL_KHR_image_base and OES_EGL_image.
        unsafe {
            Some(ImageFns {
                create: std::mem::transmute::<extern "system" fn(), CreateImageKhr>(create),
                destroy: std::mem::transmute::<extern "system" fn(), DestroyImageKhr>(destroy),
                target_texture: std::mem::transmute::<
                    extern "system" fn(),
                    ImageTargetTexture2dOes,
                >(target_texture),
            })
        }
    }

    /// Loads GL entry points for the current context.
    pub fn load_gl(&self) {
        gl::load_with(|s| {
            self.egl
                .get_proc_address(s)
                .map(|p| p as *const c_void)
                .unwrap_or(std::ptr::null())
        });
    }

    pub fn make_current(&self, surface: egl::Surface) -> Result<()> {
        self.egl
            .make_current(
                self.display,
                Some(surface),
                Some(surface),
                Some(self.context),
            )
            .context("Failed to make EGL context current")?;
        Ok(())
    }

    pub fn make_current_surfaceless(&self) -> Result<()> {
        self.egl
            .make_current(self.display, None, None, Some(self.context))
            .context("Failed to make surfaceless context current")?;
        Ok(())
    }

    pub fn create_window_surface(
        &self,
        native_window: egl::NativeWindowType,
    ) -> Result<egl::Surface> {
        let surface = unsafe {
            self.egl
                .create_window_surface(self.display, self.config, native_window, None)
        }
        .context("Failed to create EGL window surface")?;
        Ok(surface)
    }

    pub fn destroy_surface(&self, surface: egl::Surface) -> Result<()> {
        self.egl
            .destroy_surface(self.display, surface)
            .context("Failed to destroy EGL surface")?;
        Ok(())
    }

    /// 0 lets the render loop pace itself instead of blocking on vblank.
    pub fn set_swap_interval(&self, interval: i32) -> Result<()> {
        self.egl
            .swap_interval(self.display, interval)
            .context("Failed to set swap interval")?;
        Ok(())
    }

    pub fn swap_buffers(&self, surface: egl::Surface) -> Result<()> {
        self.egl
            .swap_buffers(self.display, surface)
            .context("Failed to swap buffers")?;
        Ok(())
    }

    /// Wraps every plane of `frame` in a single EGLImage.
    pub fn create_dmabuf_image(&self, frame: &CapturedFrame) -> Result<EglImage> {
        let fns = self
            .image_fns
            .as_ref()
            .ok_or_else(|| anyhow!("eglCreateImageKHR not found"))?;
        if frame.planes.is_empty() || frame.planes.len() > PLANE_ATTRIBS.len() {
            bail!("Unsupported dmabuf plane count {}", frame.planes.len());
        }

        let mut attribs = vec![
            EGL_WIDTH,
            frame.width as i32,
            EGL_HEIGHT,
            frame.height as i32,
            EGL_LINUX_DRM_FOURCC_EXT,
            frame.format as i32,
        ];
        for (plane, keys) in frame.planes.iter().zip(PLANE_ATTRIBS.iter()) {
            attribs.extend_from_slice(&[
                keys[0],
                plane.fd.as_raw_fd(),
                keys[1],
                plane.offset as i32,
                keys[2],
                plane.stride as i32,
            ]);
            if frame.modifier != DRM_FORMAT_MOD_INVALID {
                attribs.extend_from_slice(&[
                    keys[3],
                    (frame.modifier & 0xffff_ffff) as i32,
                    keys[4],
                    (frame.modifier >> 32) as i32,
                ]);
            }
        }
        attribs.push(egl::NONE);

        let image = unsafe {
            (fns.create)(
                self.display.as_ptr(),
                EGL_NO_CONTEXT,
                EGL_LINUX_DMA_BUF_EXT,
                std::ptr::null_mut(),
                attribs.as_ptr(),
            )
        };
        if image.is_null() {
            bail!(
                "Failed to create EGL image from dmabuf (egl error {:?})",
                self.egl.get_error()
            );
        }
        Ok(EglImage(image))
    }

    /// Attaches `image` to the texture currently bound to `target`.
    pub fn bind_image(&self, target: u32, image: &EglImage) {
        if let Some(fns) = &self.image_fns {
            unsafe { (fns.target_texture)(target, image.0) };
        }
    }

    pub fn destroy_image(&self, image: EglImage) {
        if let Some(fns) = &self.image_fns {
            unsafe { (fns.destroy)(self.display.as_ptr(), image.0) };
        }
    }
}

impl Drop for EglContext {
    fn drop(&mut self) {
        let _ = self.egl.make_current(self.display, None, None, None);
        let _ = self.egl.destroy_context(self.display, self.context);
        let _ = self.egl.terminate(self.display);
    }
}
