//! Core type definitions for artifact processing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing state of an artifact row.
///
/// `Pending → Success | Failed` through a processing attempt; a reprocess
/// request moves `Success → AwaitingReprocessCleanup`, and once the derived
/// children are gone the artifact drops back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Waiting to be processed.
    Pending,
    /// The last processing attempt succeeded.
    Success,
    /// The last processing attempt failed.
    Failed,
    /// Reprocessing was requested; derived artifacts are being removed.
    AwaitingReprocessCleanup,
}

impl ProcessState {
    /// The integer stored in the catalog.
    pub const fn as_i64(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Success => 1,
            Self::Failed => 2,
            Self::AwaitingReprocessCleanup => 3,
        }
    }
}

impl TryFrom<i64> for ProcessState {
    type Error = crate::Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Success),
            2 => Ok(Self::Failed),
            3 => Ok(Self::AwaitingReprocessCleanup),
            other => Err(crate::Error::invalid_input(format!(
                "unknown process state {other}"
            ))),
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::AwaitingReprocessCleanup => write!(f, "awaiting_reprocess_cleanup"),
        }
    }
}
