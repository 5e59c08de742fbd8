//! Server configuration.
//!
//! Settings load from a TOML file and are validated before anything
//! starts; a bad value at startup is a configuration error, not a runtime
//! surprise. The `cameras` list fixes the camera order (and with it the
//! sub-stream numbering on the wire); each listed name must have a matching
//! `[camera.<name>]` section.
//!
//! ```toml
//! log_filter = "info"
//! listen_port_id = 26000
//! cameras = ["left", "right"]
//!
//! [camera.left]
//! serial_number = "A00366900123042A"
//! remove_background = true
//! background_file = "left"
//! capture_background_frames = 150
//! max_depth = 1100
//! background_fuzz = 5
//!
//! [camera.right]
//! serial_number = "A00366900456817B"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::error::{Result, ServerError};

/// Top-level server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Tracing filter directive, e.g. `"info"` or
    /// `"teleview_server=debug"`.
    pub log_filter: String,
    /// TCP port the acceptor listens on.
    pub listen_port_id: u16,
    /// Ordered camera section names; camera `i` owns sub-streams `2i` and
    /// `2i + 1`.
    pub cameras: Vec<String>,
    /// Per-camera sections keyed by name.
    pub camera: HashMap<String, CameraSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            listen_port_id: 26000,
            cameras: Vec::new(),
            camera: HashMap::new(),
        }
    }
}

/// Configuration for one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Serial number selecting the device on the bus.
    pub serial_number: String,
    /// Enable background removal for this camera.
    #[serde(default = "default_remove_background")]
    pub remove_background: bool,
    /// Background file prefix to load (`<prefix>.background`).
    #[serde(default)]
    pub background_file: Option<PathBuf>,
    /// Depth frames to fold into the background at startup.
    #[serde(default)]
    pub capture_background_frames: u32,
    /// Depth beyond which every pixel counts as background (0 disables).
    #[serde(default)]
    pub max_depth: u32,
    /// Bias for the background test; positive removes more aggressively.
    #[serde(default = "default_background_fuzz")]
    pub background_fuzz: i32,
    /// Calibration override; identity transforms when omitted.
    #[serde(default)]
    pub calibration: Option<Calibration>,
}

fn default_remove_background() -> bool {
    true
}

fn default_background_fuzz() -> i32 {
    5
}

impl Settings {
    /// Load and validate settings from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.listen_port_id == 0 {
            return Err(ServerError::config("listen_port_id must not be 0"));
        }
        for name in &self.cameras {
            if name.is_empty() {
                return Err(ServerError::config("camera names must not be empty"));
            }
            let section = self.camera.get(name).ok_or_else(|| {
                ServerError::config(format!("camera '{name}' has no [camera.{name}] section"))
            })?;
            if section.serial_number.is_empty() {
                return Err(ServerError::config(format!(
                    "camera '{name}' has an empty serial_number"
                )));
            }
            if section.max_depth > 0x7ff {
                return Err(ServerError::config(format!(
                    "camera '{name}': max_depth {} exceeds the 11-bit depth range",
                    section.max_depth
                )));
            }
            if i16::try_from(section.background_fuzz).is_err() {
                return Err(ServerError::config(format!(
                    "camera '{name}': background_fuzz {} out of range",
                    section.background_fuzz
                )));
            }
        }
        Ok(())
    }

    /// Section for a validated camera name.
    pub fn camera_settings(&self, name: &str) -> Result<&CameraSettings> {
        self.camera
            .get(name)
            .ok_or_else(|| ServerError::config(format!("unknown camera '{name}'")))
    }
}
