//! Capability traits for the pool's external collaborators.
//!
//! The desktop shell that owns the pool consumes output through
//! [`DesktopSink`]; the remote server projects agent metadata through
//! [`AgentDirectory`]. Both are injected so tests can substitute doubles.

use ptyhub_protocol::AgentRunState;
use serde::Serialize;

/// Frame delivered to the in-process desktop consumer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum DesktopFrame {
    /// One flushed output batch, base64-encoded.
    Data { data: String },
    /// Final report when the child terminates.
    Exit {
        exit_code: Option<i32>,
        signal: Option<String>,
        last_output: Vec<String>,
    },
}

/// The always-present local consumer. Delivery is best-effort and must not
/// block the flush path.
pub trait DesktopSink: Send + Sync {
    fn send(&self, agent_id: &str, frame: DesktopFrame);
}

/// Sink that discards every frame. Used when no desktop consumer exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DesktopSink for NullSink {
    fn send(&self, _agent_id: &str, _frame: DesktopFrame) {}
}

/// Status of one agent as known to the owning application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStatus {
    pub state: AgentRunState,
    pub exit_code: Option<i32>,
    pub last_line: String,
}

/// Task metadata provider backing the remote agent-list projection.
/// Calls must be synchronous and non-blocking.
pub trait AgentDirectory: Send + Sync {
    fn task_name(&self, task_id: &str) -> String;
    fn agent_status(&self, agent_id: &str) -> AgentStatus;
}
