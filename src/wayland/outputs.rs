use std::collections::HashMap;
use wayland_client::{protocol::wl_output, Connection, Dispatch, QueueHandle, WEnum};
use wayland_protocols::xdg::xdg_output::zv1::client::{zxdg_output_manager_v1, zxdg_output_v1};

use super::connection::AppState;
use crate::transform::Rotation;

#[derive(Debug, Clone)]
pub struct Output {
    pub name: String,        // e.g., "DP-7", "eDP-1"
    pub description: String, // e.g., "Philips PHL 276E8V"
    pub width: i32,
    pub height: i32,
    pub refresh: i32, // mHz
    pub transform: wl_output::Transform,
    pub wl_output: wl_output::WlOutput,
    pub global_name: u32,
}

impl Output {
    pub fn new(global_name: u32, wl_output: wl_output::WlOutput) -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            width: 0,
            height: 0,
            refresh: 0,
            transform: wl_output::Transform::Normal,
            wl_output,
            global_name,
        }
    }

    /// Rotation between the captured buffer and what the user sees on this
    /// output. Flipped transforms rotate the same way.
    pub fn rotation(&self) -> Rotation {
        match self.transform {
            wl_output::Transform::_90 | wl_output::Transform::Flipped90 => Rotation::Deg90,
            wl_output::Transform::_180 | wl_output::Transform::Flipped180 => Rotation::Deg180,
            wl_output::Transform::_270 | wl_output::Transform::Flipped270 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }
}

pub struct OutputManager {
    pub outputs: HashMap<u32, Output>,
}

impl OutputManager {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
        }
    }

    pub fn add_output(&mut self, global_name: u32, wl_output: wl_output::WlOutput) {
        self.outputs
            .insert(global_name, Output::new(global_name, wl_output));
    }

    pub fn remove_output(&mut self, global_name: u32) -> Option<Output> {
        self.outputs.remove(&global_name)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Output> {
        self.outputs.values().find(|o| o.name == name)
    }

    /// Outputs sorted by name, so listings are stable across runs.
    pub fn list(&self) -> Vec<&Output> {
        let mut outputs: Vec<_> = self.outputs.values().collect();
        outputs.sort_by(|a, b| a.name.cmp(&b.name));
        outputs
    }

    /// Ask for xdg_output names, which take precedence over wl_output names.
    pub fn request_xdg_outputs(
        &self,
        manager: Option<&zxdg_output_manager_v1::ZxdgOutputManagerV1>,
        qh: &QueueHandle<AppState>,
    ) {
        if let Some(manager) = manager {
            for (global_name, output) in &self.outputs {
                manager.get_xdg_output(&output.wl_output, qh, *global_name);
            }
        }
    }
}

impl Default for OutputManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch<wl_output::WlOutput, u32> for AppState {
    fn event(
        state: &mut Self,
        _proxy: &wl_output::WlOutput,
        event: wl_output::Event,
        global_name: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(output) = state.output_manager.outputs.get_mut(global_name) else {
            return;
        };
        match event {
            wl_output::Event::Geometry {
                transform: WEnum::Value(transform),
                ..
            } => {
                output.transform = transform;
            }
            wl_output::Event::Mode {
                flags: WEnum::Value(mode_flags),
                width,
                height,
                refresh,
            } if mode_flags.contains(wl_output::Mode::Current) => {
                output.width = width;
                output.height = height;
                output.refresh = refresh;
            }
            wl_output::Event::Name { name } => {
                output.name = name;
            }
            wl_output::Event::Description { description } => {
                output.description = description;
            }
            _ => {}
        }
    }
}

impl Dispatch<zxdg_output_v1::ZxdgOutputV1, u32> for AppState {
    fn event(
        state: &mut Self,
        _proxy: &zxdg_output_v1::ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        global_name: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let Some(output) = state.output_manager.outputs.get_mut(global_name) {
            if let zxdg_output_v1::Event::Name { name } = event {
                if !name.is_empty() {
                    output.name = name;
                }
            }
        }
    }
}
