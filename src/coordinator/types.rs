//! Engine state types.
//!
//! Defines the state machine for the mirror engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (collections resolved,
//!    ↓                              ↓  schemas bootstrapped)
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(config, missing database/collection)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `MirrorEngine::new()`. Nothing opened.
//! - **Starting**: `start()` called; opening checkpoints, resolving
//!   collections, bootstrapping schemas, pushing metadata.
//! - **Running**: One delta task per collection (each with its init child).
//! - **ShuttingDown**: `shutdown()` called. Tasks flush and exit.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Startup failed. Engine cannot continue.
//!
//! A collection failing mid-run does not move the engine to `Failed`; it is
//! reported through [`CollectionOutcome`] and the other collections keep
//! running.

/// State of the mirror engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::MirrorEngine::start) to begin mirroring.
    Created,

    /// Opening checkpoints and preparing collections.
    Starting,

    /// Running: delta loops consuming change feeds, init snapshots loading.
    Running,

    /// Shutting down gracefully.
    ///
    /// Pending batches are flushed where possible.
    /// Transitions to `Stopped` when complete.
    ShuttingDown,

    /// Stopped.
    ///
    /// Engine has shut down cleanly. Safe to drop.
    Stopped,

    /// Startup failed.
    ///
    /// Check logs for error details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// How a collection's task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// Still running.
    Running,
    /// Exited on shutdown.
    Stopped,
    /// Exited on a fatal error. Checkpoints are left as they were, so a
    /// restart resumes from the last persisted position.
    Failed(String),
}

impl CollectionOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CollectionOutcome::Failed(_))
    }
}
