//! Core overlay types: lifecycle phase, events and errors

use super::ids::{HookId, SlotId};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of one overlay instance
///
/// `Open -> Closing -> Closed`, with `Closed` terminal. `Unattached` is the
/// short window in which a registry has built the overlay but not yet wired
/// its close callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayPhase {
    Unattached,
    Open,
    /// Waiting on the before-close barrier
    Closing,
    Closed,
}

impl OverlayPhase {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Lifecycle events emitted by a registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayEvent {
    /// A new overlay now occupies the slot
    Opened { slot: SlotId, generation: u64 },

    /// The previous occupant of the slot was abandoned by a new open
    Replaced { slot: SlotId, generation: u64 },

    /// Someone outside the overlay asked the slot to close
    CloseRequested { slot: SlotId, generation: u64 },

    /// The overlay finished its close sequence
    Closed { slot: SlotId, generation: u64 },

    /// The record was dropped from the registry
    Removed { slot: SlotId, generation: u64 },
}

/// Result type for overlay operations
pub type OverlayResult<T> = std::result::Result<T, OverlayError>;

/// Overlay-specific error types
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("No overlay found in the current context; the lookup must run inside an open overlay")]
    MissingContext,

    #[error("The current overlay does not produce results of type `{expected}`")]
    ResultTypeMismatch { expected: &'static str },

    #[error(transparent)]
    BeforeClose(#[from] HookFailures),

    #[error("Overlay surface error: {0}")]
    Surface(#[from] anyhow::Error),
}

/// Every before-close hook that failed during one close barrier
#[derive(Debug)]
pub struct HookFailures {
    failures: Vec<(HookId, anyhow::Error)>,
}

impl HookFailures {
    pub(crate) fn new(failures: Vec<(HookId, anyhow::Error)>) -> Self {
        Self { failures }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(HookId, anyhow::Error)> {
        self.failures.iter()
    }

    /// Merge failures collected from several overlays
    pub(crate) fn extend(&mut self, other: HookFailures) {
        self.failures.extend(other.failures);
    }
}

impl std::fmt::Display for HookFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} before-close hook(s) failed", self.failures.len())?;
        for (index, (id, error)) in self.failures.iter().enumerate() {
            let separator = if index == 0 { ": " } else { "; " };
            write!(f, "{separator}{id}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HookFailures {}
