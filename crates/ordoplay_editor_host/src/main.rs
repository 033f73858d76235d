// SPDX-License-Identifier: MIT OR Apache-2.0
//! `OrdoPlay` Editor data host
//!
//! Runs the editor's data engines without the UI:
//! - Dataflow graph evaluation (single or threaded context)
//! - Entity data storage with the compatibility bridge and undo history
//!
//! Usage: `ordoplay_editor_host [settings.ron]`. Without a path the default
//! settings are used; a missing file is created with the defaults.

mod demo;
mod settings;

use settings::HostSettings;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "ordoplay_editor_host=info,ordoplay_dataflow=info,ordoplay_data_storage=info";

fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting OrdoPlay Editor host v{}", env!("CARGO_PKG_VERSION"));

    let settings = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) if !path.exists() => {
            let settings = HostSettings::default();
            if let Err(e) = settings.save(&path) {
                tracing::warn!("Failed to write default settings to {}: {e}", path.display());
            } else {
                tracing::info!(path = %path.display(), "Wrote default settings");
            }
            settings
        }
        Some(path) => match HostSettings::load(&path) {
            Ok(settings) => {
                tracing::info!(path = %path.display(), "Loaded settings");
                settings
            }
            Err(e) => {
                tracing::error!("Failed to load settings from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => HostSettings::default(),
    };

    match demo::run_dataflow(&settings.dataflow) {
        Ok(report) => tracing::info!(
            square = report.square,
            square_after_edit = report.square_after_edit,
            divide = report.divide,
            "Dataflow demo finished"
        ),
        Err(e) => {
            tracing::error!("Dataflow demo failed: {e}");
            std::process::exit(1);
        }
    }

    match demo::run_environment(&settings.environment, settings.cycles) {
        Ok(report) => tracing::info!(
            positions = ?report.positions,
            rows_moved = report.rows_moved,
            cycles = report.cycles,
            "Environment demo finished"
        ),
        Err(e) => {
            tracing::error!("Environment demo failed: {e}");
            std::process::exit(1);
        }
    }
}
