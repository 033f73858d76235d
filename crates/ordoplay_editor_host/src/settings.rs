// SPDX-License-Identifier: MIT OR Apache-2.0
//! Host settings, stored as RON.

use ordoplay_data_storage::EnvironmentSettings;
use ordoplay_dataflow::DataflowSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Current settings format version
pub const SETTINGS_FORMAT_VERSION: u32 = 1;

/// Settings load and save errors
#[derive(Debug, Error)]
pub enum SettingsError {
    /// File could not be read or written
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid settings RON
    #[error("Invalid settings file: {0}")]
    Parse(#[from] ron::error::SpannedError),

    /// Settings could not be serialized
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] ron::Error),

    /// Written by a newer host
    #[error("Settings version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        /// Version in the file
        found: u32,
        /// Newest version this host reads
        supported: u32,
    },
}

/// Everything the host configures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Settings format version
    pub version: u32,
    /// Number of update cycles the demo environment runs
    pub cycles: u32,
    /// Dataflow evaluation
    pub dataflow: DataflowSettings,
    /// Data storage and compatibility bridge
    pub environment: EnvironmentSettings,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_FORMAT_VERSION,
            cycles: 3,
            dataflow: DataflowSettings::default(),
            environment: EnvironmentSettings::default(),
        }
    }
}

impl HostSettings {
    /// Parse settings from RON text
    pub fn from_ron(text: &str) -> Result<Self, SettingsError> {
        let settings: Self = ron::from_str(text)?;
        if settings.version > SETTINGS_FORMAT_VERSION {
            return Err(SettingsError::UnsupportedVersion {
                found: settings.version,
                supported: SETTINGS_FORMAT_VERSION,
            });
        }
        Ok(settings)
    }

    /// Pretty RON text
    pub fn to_ron(&self) -> Result<String, SettingsError> {
        let config = ron::ser::PrettyConfig::default()
            .struct_names(true)
            .enumerate_arrays(false);
        Ok(ron::ser::to_string_pretty(self, config)?)
    }

    /// Load settings from a file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_ron(&content)
    }

    /// Save settings to a file
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        std::fs::write(path, self.to_ron()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordoplay_dataflow::ContextKind;

    #[test]
    fn test_default_settings() {
        let settings = HostSettings::default();
        assert_eq!(settings.version, SETTINGS_FORMAT_VERSION);
        assert!(settings.cycles > 0);
        assert_eq!(settings.dataflow.context, ContextKind::Single);
    }

    #[test]
    fn test_serialization() {
        let mut settings = HostSettings::default();
        settings.dataflow.context = ContextKind::Threaded;
        settings.environment.compatibility.deferred_removes = false;
        let text = settings.to_ron().unwrap();
        assert_eq!(HostSettings::from_ron(&text).unwrap(), settings);
    }

    #[test]
    fn test_newer_version_rejected() {
        let result = HostSettings::from_ron("(version: 99)");
        assert!(matches!(
            result,
            Err(SettingsError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings = HostSettings::from_ron("(cycles: 7)").unwrap();
        assert_eq!(settings.cycles, 7);
        assert_eq!(settings.version, SETTINGS_FORMAT_VERSION);
        assert!(settings.environment.compatibility.use_command_buffer);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("ordoplay_host_settings_{}.ron", std::process::id()));
        let settings = HostSettings {
            cycles: 5,
            ..HostSettings::default()
        };
        settings.save(&path).unwrap();
        let loaded = HostSettings::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file() {
        let result = HostSettings::load(Path::new("/nonexistent/ordoplay/settings.ron"));
        assert!(matches!(result, Err(SettingsError::Io(_))));
    }
}
