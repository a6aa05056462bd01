//! Connector and tailer state types.
//!
//! # Connector State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting
//!    │                              │
//!    │ (never started)              │ (topology discovered)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!                              │
//!                   (tailer failed / startup error)
//!                              ↓
//!                           Failed
//! ```
//!
//! # Tailer State Transitions
//!
//! ```text
//! Init ──→ Dumping ──┐
//!   │                ↓
//!   └──────────→ Seeking ⇄ Tailing ⇄ RollingBack
//!                    ↑        │
//!                    └─ Reconnecting (from any state on a transient error)
//!
//! Stopped: terminal, after cancellation or an unrecoverable error
//! ```

/// State of the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Created but not started.
    Created,

    /// Opening the checkpoint file and discovering topology.
    Connecting,

    /// Tailers are running.
    Running,

    /// Tailers are being cancelled and joined.
    ShuttingDown,

    /// Shut down cleanly.
    Stopped,

    /// Startup failed or a tailer died. Check logs.
    Failed,
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorState::Created => write!(f, "Created"),
            ConnectorState::Connecting => write!(f, "Connecting"),
            ConnectorState::Running => write!(f, "Running"),
            ConnectorState::ShuttingDown => write!(f, "ShuttingDown"),
            ConnectorState::Stopped => write!(f, "Stopped"),
            ConnectorState::Failed => write!(f, "Failed"),
        }
    }
}

/// State of one shard's tailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    /// Reading the checkpoint.
    Init,
    /// Copying every in-scope collection (no checkpoint yet).
    Dumping,
    /// Positioning the oplog cursor at the checkpoint.
    Seeking,
    /// Applying oplog entries.
    Tailing,
    /// Reconciling targets after the checkpoint vanished from the oplog.
    RollingBack,
    /// Waiting to re-establish the source connection.
    Reconnecting,
    /// Finished.
    Stopped,
}

impl TailerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TailerState::Init => "Init",
            TailerState::Dumping => "Dumping",
            TailerState::Seeking => "Seeking",
            TailerState::Tailing => "Tailing",
            TailerState::RollingBack => "RollingBack",
            TailerState::Reconnecting => "Reconnecting",
            TailerState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for TailerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
