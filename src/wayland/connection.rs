use anyhow::{anyhow, Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::ops::{Deref, DerefMut};
use wayland_client::{
    protocol::{wl_compositor, wl_output, wl_registry},
    Connection, Dispatch, EventQueue, QueueHandle,
};
use wayland_protocols::xdg::xdg_output::zv1::client::zxdg_output_manager_v1;
use wayland_protocols_wlr::export_dmabuf::v1::client::zwlr_export_dmabuf_manager_v1;
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_shell_v1;

use super::outputs::OutputManager;

/// Globals bound from the registry. Each connection (render thread, capture
/// thread) owns its own copy.
pub struct WaylandState {
    pub compositor: Option<wl_compositor::WlCompositor>,
    pub layer_shell: Option<zwlr_layer_shell_v1::ZwlrLayerShellV1>,
    pub dmabuf_manager: Option<zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1>,
    pub xdg_output_manager: Option<zxdg_output_manager_v1::ZxdgOutputManagerV1>,
    pub output_manager: OutputManager,
}

impl WaylandState {
    pub fn new() -> Self {
        Self {
            compositor: None,
            layer_shell: None,
            dmabuf_manager: None,
            xdg_output_manager: None,
            output_manager: OutputManager::new(),
        }
    }

    pub fn compositor(&self) -> Result<&wl_compositor::WlCompositor> {
        self.compositor
            .as_ref()
            .ok_or_else(|| anyhow!("wl_compositor not available"))
    }

    pub fn layer_shell(&self) -> Result<&zwlr_layer_shell_v1::ZwlrLayerShellV1> {
        self.layer_shell
            .as_ref()
            .ok_or_else(|| anyhow!("zwlr_layer_shell_v1 not available"))
    }

    pub fn dmabuf_manager(
        &self,
    ) -> Result<&zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1> {
        self.dmabuf_manager
            .as_ref()
            .ok_or_else(|| anyhow!("zwlr_export_dmabuf_manager_v1 not available"))
    }
}

impl Default for WaylandState {
    fn default() -> Self {
        Self::new()
    }
}

/// Newtype wrapper to satisfy orphan rules
pub struct AppState(pub WaylandState);

impl Deref for AppState {
    type Target = WaylandState;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AppState {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

pub struct WaylandConnection {
    pub connection: Connection,
    pub state: AppState,
    pub queue: EventQueue<AppState>,
}

impl WaylandConnection {
    /// Connects to `$WAYLAND_DISPLAY`, binds globals and resolves output
    /// names through xdg_output.
    pub fn connect() -> Result<Self> {
        let connection =
            Connection::connect_to_env().context("Failed to connect to Wayland display")?;

        let mut state = AppState(WaylandState::new());
        let mut queue = connection.new_event_queue();
        let qh = queue.handle();

        connection.display().get_registry(&qh, ());

        // globals, then wl_output name/mode events
        queue.roundtrip(&mut state)?;
        queue.roundtrip(&mut state)?;

        let mut conn = Self {
            connection,
            state,
            queue,
        };
        conn.state.output_manager.request_xdg_outputs(
            conn.state.xdg_output_manager.as_ref(),
            &conn.queue.handle(),
        );
        conn.roundtrip()?;
        Ok(conn)
    }

    pub fn roundtrip(&mut self) -> Result<()> {
        self.queue
            .roundtrip(&mut self.state)
            .context("Wayland roundtrip failed")?;
        Ok(())
    }

    /// Flushes requests, reads whatever the compositor already sent and
    /// dispatches it. Never blocks.
    pub fn dispatch(&mut self) -> Result<()> {
        self.queue.flush()?;
        if let Some(guard) = self.queue.prepare_read() {
            let readable = {
                let mut fds = [PollFd::new(guard.connection_fd(), PollFlags::POLLIN)];
                poll(&mut fds, PollTimeout::ZERO).context("poll on Wayland socket")? > 0
            };
            if readable {
                guard.read().context("Failed to read Wayland events")?;
            }
        }
        self.queue.dispatch_pending(&mut self.state)?;
        Ok(())
    }

    pub fn queue_handle(&self) -> QueueHandle<AppState> {
        self.queue.handle()
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for AppState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => match interface.as_str() {
                "wl_compositor" => {
                    state.compositor = Some(registry.bind(name, version.min(5), qh, ()));
                }
                "zwlr_layer_shell_v1" => {
                    state.layer_shell = Some(registry.bind(name, version.min(4), qh, ()));
                }
                "zwlr_export_dmabuf_manager_v1" => {
                    state.dmabuf_manager = Some(registry.bind(name, version.min(1), qh, ()));
                }
                "zxdg_output_manager_v1" => {
                    state.xdg_output_manager = Some(registry.bind(name, version.min(3), qh, ()));
                }
                "wl_output" => {
                    let output: wl_output::WlOutput =
                        registry.bind(name, version.min(4), qh, name);
                    state.output_manager.add_output(name, output);
                }
                _ => {}
            },
            wl_registry::Event::GlobalRemove { name } => {
                if let Some(output) = state.output_manager.remove_output(name) {
                    tracing::info!(output = %output.name, "output removed");
                }
            }
            _ => {}
        }
    }
}

/// Globals that are bound only to be used as factories.
macro_rules! ignore_events {
    ($($proxy:ty),* $(,)?) => {
        $(
            impl Dispatch<$proxy, ()> for AppState {
                fn event(
                    _state: &mut Self,
                    _proxy: &$proxy,
                    _event: <$proxy as wayland_client::Proxy>::Event,
                    _data: &(),
                    _conn: &Connection,
                    _qh: &QueueHandle<Self>,
                ) {
                }
            }
        )*
    };
}

ignore_events!(
    wl_compositor::WlCompositor,
    zwlr_layer_shell_v1::ZwlrLayerShellV1,
    zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
    zxdg_output_manager_v1::ZxdgOutputManagerV1,
);
