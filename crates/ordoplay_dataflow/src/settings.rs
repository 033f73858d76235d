// SPDX-License-Identifier: MIT OR Apache-2.0
//! Evaluation settings.

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

/// Which context kind drives evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContextKind {
    /// [`crate::ContextSingle`]
    #[default]
    Single,
    /// [`crate::ContextThreaded`]
    Threaded,
}

/// Dataflow evaluation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataflowSettings {
    /// Context used by drivers that create their own
    pub context: ContextKind,
    /// Worker threads for parallel output evaluation; 0 uses the machine's parallelism
    pub thread_count: usize,
    /// Log a warning for every connection problem found before evaluation
    pub validate_before_evaluation: bool,
}

impl Default for DataflowSettings {
    fn default() -> Self {
        Self {
            context: ContextKind::Single,
            thread_count: 0,
            validate_before_evaluation: true,
        }
    }
}

impl DataflowSettings {
    /// Resolved worker count, never zero
    pub fn worker_count(&self) -> usize {
        if self.thread_count > 0 {
            return self.thread_count;
        }
        std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_never_zero() {
        let settings = DataflowSettings::default();
        assert!(settings.worker_count() >= 1);

        let fixed = DataflowSettings {
            thread_count: 3,
            ..Default::default()
        };
        assert_eq!(fixed.worker_count(), 3);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let settings: DataflowSettings = ron::from_str("(context: Threaded)").unwrap();
        assert_eq!(settings.context, ContextKind::Threaded);
        assert!(settings.validate_before_evaluation);
    }
}
