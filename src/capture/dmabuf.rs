use anyhow::{anyhow, Context, Result as AnyResult};
use drm_fourcc::DrmFourcc;
use glam::{Mat4, Vec3};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wayland_client::{protocol::wl_output, Connection, Dispatch, QueueHandle};
use wayland_protocols_wlr::export_dmabuf::v1::client::{
    zwlr_export_dmabuf_frame_v1::{self, ZwlrExportDmabufFrameV1},
    zwlr_export_dmabuf_manager_v1::ZwlrExportDmabufManagerV1,
};

use crate::error::Result;
use crate::producer::{NegotiatedFormat, Producer, ProducerLink, StartRequest};
use crate::render::{GlesGpu, ImageStream, TextureId};
use crate::transform::Rotation;
use crate::wayland::{AppState, WaylandConnection};

/// How long to back off after the compositor cancels a capture.
const CANCEL_BACKOFF: Duration = Duration::from_millis(10);
const FRAME_POLL: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct DmabufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub stride: u32,
}

/// One exported output buffer. Dropping it closes the plane fds.
#[derive(Debug)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub format: u32, // DRM fourcc
    pub modifier: u64,
    pub planes: Vec<DmabufPlane>,
    /// Output transform the frame was rendered with
    pub rotation: Rotation,
}

/// Newtype wrapper for frame capture state to satisfy orphan rules
pub struct FrameCaptureData(Arc<Mutex<FrameCaptureState>>);

#[derive(Default)]
struct FrameCaptureState {
    frame: Option<CapturedFrame>,
    width: u32,
    height: u32,
    format: u32,
    modifier: u64,
    planes: Vec<Option<DmabufPlane>>,
    done: bool,
    cancelled: bool,
}

/// Single in-flight export request on one connection.
struct DmabufCapture {
    state: Arc<Mutex<FrameCaptureState>>,
}

impl DmabufCapture {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FrameCaptureState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FrameCaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_frame(
        &self,
        manager: &ZwlrExportDmabufManagerV1,
        output: &wl_output::WlOutput,
        qh: &QueueHandle<AppState>,
        include_cursor: bool,
    ) {
        *self.lock() = FrameCaptureState::default();
        manager.capture_output(
            i32::from(include_cursor),
            output,
            qh,
            FrameCaptureData(self.state.clone()),
        );
    }

    fn is_done(&self) -> bool {
        let state = self.lock();
        state.done || state.cancelled
    }

    fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    fn take_frame(&self) -> Option<CapturedFrame> {
        self.lock().frame.take()
    }
}

impl Dispatch<ZwlrExportDmabufFrameV1, FrameCaptureData> for AppState {
    fn event(
        _state: &mut Self,
        proxy: &ZwlrExportDmabufFrameV1,
        event: zwlr_export_dmabuf_frame_v1::Event,
        data: &FrameCaptureData,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let mut capture = data.0.lock().unwrap_or_else(PoisonError::into_inner);

        match event {
            zwlr_export_dmabuf_frame_v1::Event::Frame {
                width,
                height,
                format,
                mod_high,
                mod_low,
                num_objects,
                ..
            } => {
                capture.width = width;
                capture.height = height;
                capture.format = format;
                capture.modifier = (u64::from(mod_high) << 32) | u64::from(mod_low);
                capture.planes.clear();
                capture.planes.resize_with(num_objects as usize, || None);
            }
            zwlr_export_dmabuf_frame_v1::Event::Object {
                fd,
                offset,
                stride,
                plane_index,
                ..
            } => {
                let index = plane_index as usize;
                if capture.planes.len() <= index {
                    capture.planes.resize_with(index + 1, || None);
                }
                capture.planes[index] = Some(DmabufPlane { fd, offset, stride });
            }
            zwlr_export_dmabuf_frame_v1::Event::Ready { .. } => {
                let planes: Option<Vec<_>> = capture.planes.drain(..).collect();
                match planes {
                    Some(planes) => {
                        capture.frame = Some(CapturedFrame {
                            width: capture.width,
                            height: capture.height,
                            format: capture.format,
                            modifier: capture.modifier,
                            planes,
                            rotation: Rotation::Deg0,
                        });
                        capture.done = true;
                    }
                    None => {
                        tracing::warn!("exported frame is missing planes");
                        capture.cancelled = true;
                    }
                }
                proxy.destroy();
            }
            zwlr_export_dmabuf_frame_v1::Event::Cancel { reason } => {
                tracing::trace!(?reason, "frame export cancelled");
                capture.cancelled = true;
                proxy.destroy();
            }
            _ => {}
        }
    }
}

type FrameSlot = Arc<Mutex<Option<CapturedFrame>>>;

struct CaptureWorker {
    source: usize,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Captures a wlroots output through `zwlr_export_dmabuf_manager_v1` on its
/// own thread and Wayland connection. Only the newest frame is kept.
pub struct DmabufProducer {
    sources: Vec<String>,
    include_cursor: bool,
    latest: FrameSlot,
    link: Option<Arc<ProducerLink>>,
    worker: Option<CaptureWorker>,
    stopping: Vec<JoinHandle<()>>,
}

impl DmabufProducer {
    /// `sources` are output names; a [`crate::producer::SourceSelector`]
    /// indexes into them.
    pub fn new(sources: Vec<String>, include_cursor: bool) -> Self {
        Self {
            sources,
            include_cursor,
            latest: Arc::new(Mutex::new(None)),
            link: None,
            worker: None,
            stopping: Vec::new(),
        }
    }

    pub fn source_name(&self, index: usize) -> Option<&str> {
        self.sources.get(index).map(String::as_str)
    }

    fn join_stopping(&mut self) {
        for handle in self.stopping.drain(..) {
            if handle.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
    }
}

impl Producer<GlesGpu> for DmabufProducer {
    type Stream = DmabufStream;

    fn bind(&mut self, texture: TextureId, link: Arc<ProducerLink>) -> Result<DmabufStream> {
        tracing::debug!(texture = texture.0, "binding capture output");
        self.link = Some(link);
        Ok(DmabufStream {
            latest: self.latest.clone(),
            current: None,
        })
    }

    fn start(&mut self, request: StartRequest) {
        let Some(link) = self.link.clone() else {
            tracing::warn!("capture started before bind, ignoring");
            return;
        };
        if self.sources.is_empty() {
            tracing::warn!("no capture sources configured");
            return;
        }
        let source = request.source.0 % self.sources.len();
        if let Some(worker) = &self.worker {
            if worker.source == source {
                // export_dmabuf always delivers the native output size
                tracing::debug!(
                    width = request.width,
                    height = request.height,
                    "capture already running"
                );
                return;
            }
            self.stop(true);
        }
        self.join_stopping();

        let output = self.sources[source].clone();
        let stop = Arc::new(AtomicBool::new(false));
        let params = CaptureParams {
            output: output.clone(),
            include_cursor: self.include_cursor,
            latest: self.latest.clone(),
            link,
            stop: stop.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("capture-{output}"))
            .spawn(move || capture_loop(params));
        match spawned {
            Ok(handle) => {
                tracing::info!(%output, "capture started");
                self.worker = Some(CaptureWorker {
                    source,
                    stop,
                    handle,
                });
            }
            Err(e) => tracing::error!(error = %e, "failed to spawn capture thread"),
        }
    }

    fn stop(&mut self, wait: bool) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            self.stopping.push(worker.handle);
        }
        if wait {
            self.join_stopping();
            self.latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    fn source_count(&self) -> usize {
        self.sources.len()
    }
}

impl Drop for DmabufProducer {
    fn drop(&mut self) {
        Producer::<GlesGpu>::stop(self, true);
    }
}

struct CaptureParams {
    output: String,
    include_cursor: bool,
    latest: FrameSlot,
    link: Arc<ProducerLink>,
    stop: Arc<AtomicBool>,
}

fn capture_loop(params: CaptureParams) {
    if let Err(e) = run_capture(&params) {
        tracing::error!(output = %params.output, error = format_args!("{e:#}"), "capture thread failed");
    }
    tracing::debug!(output = %params.output, "capture thread exiting");
}

/// Runs `step` until `done` or `stop`, sleeping [`FRAME_POLL`] between
/// unfinished steps so an idle output does not spin the thread.
fn wait_for_frame(
    done: impl Fn() -> bool,
    stop: &AtomicBool,
    mut step: impl FnMut() -> AnyResult<()>,
) -> AnyResult<()> {
    while !done() && !stop.load(Ordering::Acquire) {
        step()?;
        if !done() {
            thread::sleep(FRAME_POLL);
        }
    }
    Ok(())
}

fn run_capture(params: &CaptureParams) -> AnyResult<()> {
    let mut conn = WaylandConnection::connect().context("capture connection")?;
    let manager = conn.state.dmabuf_manager()?.clone();
    let (output, rotation) = {
        let output = conn
            .state
            .output_manager
            .get_by_name(&params.output)
            .ok_or_else(|| anyhow!("Output '{}' not found", params.output))?;
        (output.wl_output.clone(), output.rotation())
    };

    let capture = DmabufCapture::new();
    let mut last_format = None;
    while !params.stop.load(Ordering::Acquire) {
        let qh = conn.queue_handle();
        capture.request_frame(&manager, &output, &qh, params.include_cursor);
        wait_for_frame(|| capture.is_done(), &params.stop, || conn.roundtrip())?;

        let Some(mut frame) = capture.take_frame() else {
            if capture.is_cancelled() {
                thread::sleep(CANCEL_BACKOFF);
            }
            continue;
        };
        frame.rotation = rotation;

        let format = NegotiatedFormat {
            width: frame.width,
            height: frame.height,
            rotation,
        };
        if last_format != Some(format) {
            tracing::info!(
                width = frame.width,
                height = frame.height,
                fourcc = %fourcc_name(frame.format),
                modifier = format_args!("0x{:x}", frame.modifier),
                planes = frame.planes.len(),
                rotation = rotation.degrees(),
                "capture format"
            );
            params.link.report_format(format);
            last_format = Some(format);
        }

        // replaces, and so releases, any frame the renderer never latched
        *params
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(frame);
        params.link.frame_available();
    }
    Ok(())
}

fn fourcc_name(format: u32) -> String {
    DrmFourcc::try_from(format)
        .map(|f| f.to_string())
        .unwrap_or_else(|_| format!("0x{format:08x}"))
}

/// Render-thread half of [`DmabufProducer`].
pub struct DmabufStream {
    latest: FrameSlot,
    /// Keeps the attached buffer's fds open while it is sampled
    current: Option<CapturedFrame>,
}

impl ImageStream<GlesGpu> for DmabufStream {
    fn latch(&mut self, gpu: &mut GlesGpu, texture: TextureId) -> Option<Mat4> {
        let frame = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match gpu.import_dmabuf(texture, &frame) {
            Ok(()) => {
                let sampling = sampling_transform(frame.rotation);
                self.current = Some(frame);
                Some(sampling)
            }
            Err(e) => {
                tracing::warn!(error = format_args!("{e:#}"), "failed to import frame");
                None
            }
        }
    }
}

/// Texture-coordinate transform for an exported buffer: flips rows (dmabufs
/// are top-down) and undoes the output rotation.
pub fn sampling_transform(rotation: Rotation) -> Mat4 {
    let center = Vec3::new(0.5, 0.5, 0.0);
    let flip = Mat4::from_translation(Vec3::Y) * Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0));
    let angle = (rotation.degrees() as f32).to_radians();
    Mat4::from_translation(center) * Mat4::from_rotation_z(angle) * Mat4::from_translation(-center)
        * flip
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn apply(m: Mat4, u: f32, v: f32) -> (f32, f32) {
        let out = m * Vec4::new(u, v, 0.0, 1.0);
        ((out.x * 1e4).round() / 1e4, (out.y * 1e4).round() / 1e4)
    }

    #[test]
    fn upright_frame_only_flips_rows() {
        let m = sampling_transform(Rotation::Deg0);
        assert_eq!(apply(m, 0.0, 0.0), (0.0, 1.0));
        assert_eq!(apply(m, 1.0, 1.0), (1.0, 0.0));
        assert_eq!(apply(m, 0.5, 0.5), (0.5, 0.5));
    }

    #[test]
    fn half_turn_mirrors_columns() {
        let m = sampling_transform(Rotation::Deg180);
        assert_eq!(apply(m, 0.0, 0.0), (1.0, 0.0));
        assert_eq!(apply(m, 1.0, 1.0), (0.0, 1.0));
    }

    #[test]
    fn every_rotation_maps_corners_to_corners() {
        for degrees in [0, 90, 180, 270] {
            let m = sampling_transform(Rotation::from_degrees(degrees));
            for (u, v) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
                let (x, y) = apply(m, u, v);
                assert!(x == 0.0 || x == 1.0, "{degrees}: x = {x}");
                assert!(y == 0.0 || y == 1.0, "{degrees}: y = {y}");
            }
        }
    }

    #[test]
    fn unknown_fourcc_prints_hex() {
        assert_eq!(fourcc_name(0), "0x00000000");
        assert_ne!(fourcc_name(DrmFourcc::Xrgb8888 as u32), "0x34325258");
    }

    #[test]
    fn start_before_bind_is_ignored() {
        let mut producer = DmabufProducer::new(vec!["DP-1".into()], false);
        Producer::<GlesGpu>::start(
            &mut producer,
            StartRequest {
                width: 640,
                height: 480,
                source: Default::default(),
            },
        );
        assert!(!Producer::<GlesGpu>::is_running(&producer));
        assert_eq!(Producer::<GlesGpu>::source_count(&producer), 1);
        assert_eq!(producer.source_name(0), Some("DP-1"));
    }

    #[test]
    fn frame_wait_sleeps_between_unfinished_roundtrips() {
        use std::cell::Cell;
        use std::time::Instant;

        let steps = Cell::new(0u32);
        let stop = AtomicBool::new(false);
        let started = Instant::now();
        wait_for_frame(
            || steps.get() >= 5,
            &stop,
            || {
                steps.set(steps.get() + 1);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(steps.get(), 5);
        assert!(started.elapsed() >= FRAME_POLL * 4);
    }

    #[test]
    fn frame_wait_returns_once_stopped() {
        let stop = AtomicBool::new(false);
        let mut steps = 0;
        wait_for_frame(
            || false,
            &stop,
            || {
                steps += 1;
                stop.store(true, Ordering::Release);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(steps, 1);
    }
}
