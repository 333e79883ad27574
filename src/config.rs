use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::render::EncoderPacing;
use crate::transform::{ContentGeometry, Rotation, ScaleMode};

/// Preview settings, loadable from a JSON file. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreviewConfig {
    pub scale_mode: ScaleMode,
    /// RGBA colour behind letterbox and viewport bars
    pub clear_color: [f32; 4],
    /// Draw cadence of the render loop
    pub fps: u32,
    pub encoder_pacing: EncoderPacing,
    /// Fixed content size, for producers that never report one
    pub content: Option<ContentOverride>,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            scale_mode: ScaleMode::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            fps: 60,
            encoder_pacing: EncoderPacing::default(),
            content: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentOverride {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub rotation: i32,
}

impl ContentOverride {
    pub fn geometry(&self) -> ContentGeometry {
        ContentGeometry::new(
            self.width,
            self.height,
            Rotation::from_degrees(self.rotation),
        )
    }
}

impl PreviewConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse preview config")
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}
