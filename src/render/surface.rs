use anyhow::{Context, Result};
use khronos_egl as egl;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use wayland_client::{
    protocol::{wl_output, wl_surface},
    Connection, Dispatch, Proxy, QueueHandle,
};
use wayland_egl::WlEglSurface;
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1,
    zwlr_layer_surface_v1::{self, ZwlrLayerSurfaceV1},
};

use crate::render::EglContext;
use crate::wayland::WaylandState;

/// Where the preview sits on its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Cover the whole output
    Fullscreen,
    /// Fixed-size box in the top right corner
    Corner { width: u32, height: u32, margin: i32 },
}

/// Shared with the layer surface dispatcher
pub struct SurfaceData {
    configured: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    pending_size: Arc<Mutex<(u32, u32)>>,
}

pub struct PreviewSurface {
    pub wl_surface: wl_surface::WlSurface,
    pub layer_surface: ZwlrLayerSurfaceV1,
    pub egl_surface: WlEglSurface,
    pub egl_window_surface: egl::Surface,
    pub width: u32,
    pub height: u32,
    configured: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    pending_size: Arc<Mutex<(u32, u32)>>,
}

impl PreviewSurface {
    pub fn new(
        globals: &WaylandState,
        output: &wl_output::WlOutput,
        placement: Placement,
        egl_ctx: &EglContext,
        qh: &QueueHandle<crate::wayland::AppState>,
    ) -> Result<Self> {
        let (width, height) = match placement {
            Placement::Fullscreen => (1, 1),
            Placement::Corner { width, height, .. } => (width, height),
        };
        let configured = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let pending_size = Arc::new(Mutex::new((width, height)));

        let wl_surface = globals.compositor()?.create_surface(qh, ());
        let layer_surface = globals.layer_shell()?.get_layer_surface(
            &wl_surface,
            Some(output),
            zwlr_layer_shell_v1::Layer::Top,
            "live-preview".to_string(),
            qh,
            SurfaceData {
                configured: configured.clone(),
                closed: closed.clone(),
                pending_size: pending_size.clone(),
            },
        );

        match placement {
            Placement::Fullscreen => {
                layer_surface.set_anchor(
                    zwlr_layer_surface_v1::Anchor::Top
                        | zwlr_layer_surface_v1::Anchor::Bottom
                        | zwlr_layer_surface_v1::Anchor::Left
                        | zwlr_layer_surface_v1::Anchor::Right,
                );
                layer_surface.set_exclusive_zone(-1);
            }
            Placement::Corner {
                width,
                height,
                margin,
            } => {
                layer_surface.set_anchor(
                    zwlr_layer_surface_v1::Anchor::Top | zwlr_layer_surface_v1::Anchor::Right,
                );
                layer_surface.set_size(width, height);
                layer_surface.set_margin(margin, margin, 0, 0);
            }
        }
        layer_surface
            .set_keyboard_interactivity(zwlr_layer_surface_v1::KeyboardInteractivity::None);

        // first commit without a buffer asks for a configure
        wl_surface.commit();

        let egl_surface = WlEglSurface::new(wl_surface.id(), width as i32, height as i32)
            .context("Failed to create WlEglSurface")?;
        let egl_window_surface =
            egl_ctx.create_window_surface(egl_surface.ptr() as egl::NativeWindowType)?;

        Ok(Self {
            wl_surface,
            layer_surface,
            egl_surface,
            egl_window_surface,
            width,
            height,
            configured,
            closed,
            pending_size,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// The compositor withdrew the surface, e.g. because its output went away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Applies the last configured size. Returns true if it changed.
    pub fn resize_if_needed(&mut self) -> bool {
        let pending = *self
            .pending_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending == (self.width, self.height) {
            return false;
        }
        (self.width, self.height) = pending;
        self.egl_surface
            .resize(self.width as i32, self.height as i32, 0, 0);
        true
    }

    pub fn commit(&self) {
        self.wl_surface.commit();
    }

    /// Destroys the EGL window surface. Call before dropping, with the
    /// context no longer current on it.
    pub fn release_egl(&self, egl_ctx: &EglContext) -> Result<()> {
        egl_ctx.destroy_surface(self.egl_window_surface)
    }
}

impl Dispatch<ZwlrLayerSurfaceV1, SurfaceData> for crate::wayland::AppState {
    fn event(
        _state: &mut Self,
        surface: &ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        data: &SurfaceData,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                surface.ack_configure(serial);
                if width > 0 && height > 0 {
                    *data
                        .pending_size
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = (width, height);
                }
                data.configured.store(true, Ordering::Release);
            }
            zwlr_layer_surface_v1::Event::Closed => {
                tracing::info!("preview surface closed by compositor");
                data.closed.store(true, Ordering::Release);
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_surface::WlSurface, ()> for crate::wayland::AppState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_surface::WlSurface,
        _event: wl_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Drop for PreviewSurface {
    fn drop(&mut self) {
        self.layer_surface.destroy();
        self.wl_surface.destroy();
    }
}
