mod control;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use control::ControlRequest;
use live_preview::capture::DmabufProducer;
use live_preview::render::{EglContext, GlesGpu, Placement, PreviewSurface};
use live_preview::wayland::WaylandConnection;
use live_preview::{
    EncoderSink, FrameCounter, PreviewConfig, ScaleMode, SurfaceLifecycleController,
};

/// Gap between a corner preview and the output edges
const CORNER_MARGIN: i32 = 16;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ScaleModeArg {
    /// Stretch to fill the surface, ignoring aspect ratio
    Stretch,
    /// Keep aspect ratio by shrinking the viewport (bars are never drawn over)
    Viewport,
    /// Keep aspect ratio, fit inside the surface (letterbox/pillarbox)
    Letterbox,
    /// Keep aspect ratio, fill the surface and crop the overflow
    Crop,
}

impl From<ScaleModeArg> for ScaleMode {
    fn from(arg: ScaleModeArg) -> Self {
        match arg {
            ScaleModeArg::Stretch => ScaleMode::StretchFit,
            ScaleModeArg::Viewport => ScaleMode::KeepAspectViewport,
            ScaleModeArg::Letterbox => ScaleMode::KeepAspectLetterbox,
            ScaleModeArg::Crop => ScaleMode::CropCenter,
        }
    }
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
    let w: u32 = w.parse().map_err(|_| format!("invalid width '{w}'"))?;
    let h: u32 = h.parse().map_err(|_| format!("invalid height '{h}'"))?;
    if w == 0 || h == 0 {
        return Err("size must be non-zero".into());
    }
    Ok((w, h))
}

#[derive(Parser)]
#[command(name = "live-preview")]
#[command(about = "Zero-copy live preview of a Sway/wlroots output")]
struct Cli {
    /// Outputs to preview (e.g., eDP-1 DP-7); --toggle cycles through them
    sources: Vec<String>,

    /// Output to show the preview on (default: first output not being previewed)
    #[arg(short, long)]
    to: Option<String>,

    /// List available outputs and exit
    #[arg(short, long)]
    list: bool,

    /// Include cursor in the preview
    #[arg(long, default_value = "true")]
    cursor: bool,

    /// Scaling mode (overrides the config file)
    #[arg(short, long, value_enum)]
    scale: Option<ScaleModeArg>,

    /// Show a WIDTHxHEIGHT box in the top right corner instead of fullscreen
    #[arg(long, value_parser = parse_size)]
    size: Option<(u32, u32)>,

    /// Draw rate (overrides the config file)
    #[arg(long)]
    fps: Option<u32>,

    /// Attach a counting encoder sink and log what it receives
    #[arg(long)]
    encoder_stats: bool,

    /// JSON preview config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop a running instance
    #[arg(long, group = "control")]
    stop: bool,

    /// Pause capture in a running instance
    #[arg(long, group = "control")]
    pause: bool,

    /// Resume capture in a running instance
    #[arg(long, group = "control")]
    resume: bool,

    /// Switch a running instance to its next source
    #[arg(long, group = "control")]
    toggle: bool,
}

impl Cli {
    fn control_request(&self) -> Option<ControlRequest> {
        [
            (self.stop, ControlRequest::Stop),
            (self.pause, ControlRequest::Pause),
            (self.resume, ControlRequest::Resume),
            (self.toggle, ControlRequest::Toggle),
        ]
        .into_iter()
        .find_map(|(set, request)| set.then_some(request))
    }

    fn preview_config(&self) -> Result<PreviewConfig> {
        let mut config = match &self.config {
            Some(path) => PreviewConfig::load(path)?,
            None => PreviewConfig::default(),
        };
        if let Some(scale) = self.scale {
            config.scale_mode = scale.into();
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if let Some(request) = cli.control_request() {
        return control::send(request);
    }

    if let Some(pid) = control::running_instance() {
        bail!("live-preview is already running (PID {pid}). Use --stop to stop it.");
    }

    let config = cli.preview_config()?;
    let mut conn = WaylandConnection::connect()?;

    if cli.list {
        println!("Available outputs:");
        for output in conn.state.output_manager.list() {
            println!(
                "  {} - {} ({}x{}, rotated {})",
                output.name,
                output.description,
                output.width,
                output.height,
                output.rotation().degrees()
            );
        }
        return Ok(());
    }

    if cli.sources.is_empty() {
        bail!("At least one source output is required. Use --list to see available outputs.");
    }
    for name in &cli.sources {
        if conn.state.output_manager.get_by_name(name).is_none() {
            bail!("Source output '{name}' not found");
        }
    }

    let target = match &cli.to {
        Some(name) => conn
            .state
            .output_manager
            .get_by_name(name)
            .ok_or_else(|| anyhow!("Target output '{name}' not found"))?,
        None => conn
            .state
            .output_manager
            .list()
            .into_iter()
            .find(|o| !cli.sources.contains(&o.name))
            .ok_or_else(|| anyhow!("No output left to show the preview on; pass --to"))?,
    };
    let target_name = target.name.clone();
    let target_output = target.wl_output.clone();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")?;
    control::install_signal_handlers()?;

    let wayland_display = conn.connection.backend().display_ptr() as *mut c_void;
    let egl_ctx = EglContext::new(wayland_display)?;
    egl_ctx.make_current_surfaceless()?;
    let gpu = GlesGpu::new(egl_ctx);

    let placement = match cli.size {
        Some((width, height)) => Placement::Corner {
            width,
            height,
            margin: CORNER_MARGIN,
        },
        None => Placement::Fullscreen,
    };
    let mut surface = {
        let qh = conn.queue_handle();
        PreviewSurface::new(&conn.state, &target_output, placement, gpu.egl(), &qh)
            .with_context(|| format!("Failed to create preview surface on {target_name}"))?
    };
    while !surface.is_configured() {
        conn.roundtrip()?;
    }
    surface.resize_if_needed();
    gpu.egl().make_current(surface.egl_window_surface)?;
    if let Err(e) = gpu.egl().set_swap_interval(0) {
        tracing::warn!(error = format_args!("{e:#}"), "could not disable vsync throttling");
    }

    let producer = DmabufProducer::new(cli.sources.clone(), cli.cursor);
    let mut preview = SurfaceLifecycleController::new(gpu, producer, &config);

    let counter = Arc::new(FrameCounter::new());
    if cli.encoder_stats {
        let sink: Arc<dyn EncoderSink> = counter.clone();
        preview.bind_encoder(&sink);
    }

    preview.surface_created()?;
    preview.surface_changed(surface.width, surface.height);

    control::write_pid_file()?;
    tracing::info!(
        sources = ?cli.sources,
        target = %target_name,
        mode = ?config.scale_mode,
        "preview active, press Ctrl+C or use --stop to stop"
    );

    let frame_interval = config.frame_interval();
    let mut result = Ok(());
    'frames: while running.load(Ordering::SeqCst) {
        let tick = Instant::now();

        for request in control::take_requests() {
            match request {
                ControlRequest::Stop => break 'frames,
                ControlRequest::Pause => preview.pause(),
                ControlRequest::Resume => preview.resume(),
                ControlRequest::Toggle => {
                    preview.toggle_source();
                    let source = preview.source().0;
                    tracing::info!(
                        output = preview.producer().source_name(source).unwrap_or("?"),
                        "previewing next source"
                    );
                }
            }
        }

        if surface.is_closed() {
            break;
        }
        if surface.resize_if_needed() {
            preview.surface_changed(surface.width, surface.height);
        }

        preview.draw_frame();
        if let Err(e) = preview
            .gpu()
            .egl()
            .swap_buffers(surface.egl_window_surface)
            .and_then(|()| conn.dispatch())
        {
            result = Err(e);
            break;
        }

        if let Some(rest) = frame_interval.checked_sub(tick.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    tracing::info!("stopping preview");
    if let Some(stats) = preview.stats() {
        tracing::info!(?stats, "render loop totals");
    }
    preview.surface_destroyed();
    if cli.encoder_stats {
        tracing::info!(
            frames = counter.frames(),
            handshakes = counter.handshakes(),
            "encoder sink totals"
        );
    }

    let egl = preview.gpu().egl();
    egl.make_current_surfaceless()?;
    surface.release_egl(egl)?;
    drop(surface);
    let _ = conn.roundtrip();

    control::remove_pid_file();
    result
}
