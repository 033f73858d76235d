// SPDX-License-Identifier: MIT OR Apache-2.0
//! Storage and compatibility settings.

use serde::{Deserialize, Serialize};

/// Data storage behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStorageSettings {
    /// Flush deferred row commands after every tick phase, not only at the start of the tick
    pub flush_deferred_each_phase: bool,
    /// Honor activation requests; when off, activatable queries never run
    pub activatable_queries: bool,
}

impl Default for DataStorageSettings {
    fn default() -> Self {
        Self {
            flush_deferred_each_phase: true,
            activatable_queries: true,
        }
    }
}

/// How much of the command buffer to log before it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum CommandBufferPrint {
    /// Nothing
    #[default]
    Off,
    /// One line per batch
    Summary,
    /// Every command
    Full,
}

/// Compatibility bridge behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilitySettings {
    /// Queue registrations and run them at the next tick
    pub use_command_buffer: bool,
    /// Queue removals as well; removal notifications are always immediate
    pub deferred_removes: bool,
    /// Collapse and cancel commands before running them
    pub optimize_command_buffer: bool,
    /// Command buffer logging
    pub print_command_buffer: CommandBufferPrint,
    /// Sweep dead objects after garbage collection
    pub integrate_with_gc: bool,
}

impl Default for CompatibilitySettings {
    fn default() -> Self {
        Self {
            use_command_buffer: true,
            deferred_removes: true,
            optimize_command_buffer: true,
            print_command_buffer: CommandBufferPrint::Off,
            integrate_with_gc: true,
        }
    }
}

/// Settings for a whole [`crate::Environment`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSettings {
    /// Storage settings
    pub storage: DataStorageSettings,
    /// Compatibility settings
    pub compatibility: CompatibilitySettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_buffer_commands() {
        let settings = EnvironmentSettings::default();
        assert!(settings.compatibility.use_command_buffer);
        assert!(settings.storage.activatable_queries);
        assert_eq!(settings.compatibility.print_command_buffer, CommandBufferPrint::Off);
    }

    #[test]
    fn test_partial_ron() {
        let settings: EnvironmentSettings =
            ron::from_str("(compatibility: (deferred_removes: false, print_command_buffer: Full))").unwrap();
        assert!(!settings.compatibility.deferred_removes);
        assert!(settings.compatibility.use_command_buffer);
        assert_eq!(settings.compatibility.print_command_buffer, CommandBufferPrint::Full);
    }
}
