//! Ambient configuration layer: persists the serial port, PPM bitrate, and
//! power-control mode a caller last used, the way `blri`'s `BlriConfig`
//! persists target/package/port so repeated invocations don't require
//! re-entering them.

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

/// Persisted host-side defaults for driving the PPM bootloader CLI.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PpmBootConfig {
    /// Serial port the PPM adapter is attached to.
    pub port: Option<String>,
    /// Average PPM bitrate, in bits/second.
    pub bitrate: u32,
    /// The user cycles target power manually rather than the host doing it.
    pub manual_power: bool,
    /// Project id of the chip most recently programmed, shown as a hint.
    pub last_project_id: Option<u16>,
}

impl Default for PpmBootConfig {
    fn default() -> Self {
        Self {
            port: None,
            bitrate: 10_000,
            manual_power: true,
            last_project_id: None,
        }
    }
}

impl PpmBootConfig {
    /// Path to the persisted settings file, rooted at the current directory
    /// so running from a project checkout doesn't touch the user's home.
    pub fn settings_path() -> Option<PathBuf> {
        std::env::current_dir()
            .ok()
            .map(|dir| dir.join("target").join("settings.toml"))
    }

    /// Loads configuration from disk, falling back to defaults on any
    /// missing file or parse failure.
    pub fn load() -> Self {
        if let Some(path) = Self::settings_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                if let Ok(config) = toml::from_str::<PpmBootConfig>(&content) {
                    println!(
                        "{} {}",
                        "loaded configuration:".bright_blue().bold(),
                        path.display()
                    );
                    return config;
                }
            }
        }
        Self::default()
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let Some(path) = Self::settings_path() else {
            return Err("cannot determine current directory".into());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        println!(
            "{} {}",
            "saved configuration to:".bright_green().bold(),
            path.display()
        );
        Ok(())
    }
}
