//! Error types for fleet orchestration.

use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::ActiveSession;

/// Bad launch input. Always reported before any window is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("launch item {index} has an empty tool id")]
    EmptyToolId { index: usize },

    #[error("unknown tool '{tool}' in launch item {index}")]
    UnknownTool { index: usize, tool: String },

    #[error("tool '{tool}' cannot be launched (attach-only)")]
    NotLaunchable { tool: String },

    #[error("working directory does not exist: {}", path.display())]
    DirectoryMissing { path: PathBuf },

    #[error("executable '{executable}' for tool '{tool}' not found on PATH")]
    ExecutableMissing { tool: String, executable: String },

    #[error("launch request contains zero instances")]
    ZeroInstances,

    #[error("the external target only supports attaching existing windows")]
    ExternalTarget,
}

/// A terminal automation provider call failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutomationError {
    #[error("failed to launch window: {0}")]
    Launch(String),

    #[error("failed to set bounds on window {window_id}: {message}")]
    Bounds { window_id: String, message: String },

    #[error("failed to close window {window_id}: {message}")]
    Close { window_id: String, message: String },

    #[error("failed to focus window {window_id}: {message}")]
    Focus { window_id: String, message: String },

    #[error("failed to decorate window {window_id}: {message}")]
    Identity { window_id: String, message: String },

    #[error("window {0} not found")]
    UnknownWindow(String),

    #[error("automation provider unavailable: {0}")]
    Unavailable(String),
}

impl AutomationError {
    /// Window the failure relates to, when there is one.
    pub fn window_id(&self) -> Option<&str> {
        match self {
            Self::Bounds { window_id, .. }
            | Self::Close { window_id, .. }
            | Self::Focus { window_id, .. }
            | Self::Identity { window_id, .. } => Some(window_id),
            Self::UnknownWindow(id) => Some(id),
            Self::Launch(_) | Self::Unavailable(_) => None,
        }
    }
}

/// A malformed event-log record. Never surfaced past the tailer.
#[derive(Error, Debug)]
#[error("malformed event record at byte {offset}: {source}")]
pub struct ProtocolError {
    pub offset: u64,
    #[source]
    pub source: serde_json::Error,
}

/// The lifecycle-report CLI could not work out which agent it speaks for.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityResolutionError {
    #[error("missing session id (pass --session-id or set AGENT_FLEET_SESSION_ID)")]
    MissingSession,

    #[error("missing agent id (pass --agent-id or set AGENT_FLEET_AGENT_ID)")]
    MissingAgent,
}

/// Persistence failures from a session or preset store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error for controller operations.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Automation(#[from] AutomationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no active session")]
    NoActiveSession,

    #[error("unknown agent {0}")]
    UnknownAgent(String),

    #[error("{} window(s) failed to close", failures.len())]
    PartialClose { failures: Vec<AutomationError> },

    /// A window could not be created. `session` holds the windows opened
    /// before the failure and has already been persisted.
    #[error("launch stopped after {} window(s): {source}", session.agents.len())]
    LaunchInterrupted {
        session: Box<ActiveSession>,
        #[source]
        source: AutomationError,
    },
}

pub type Result<T> = std::result::Result<T, FleetError>;
