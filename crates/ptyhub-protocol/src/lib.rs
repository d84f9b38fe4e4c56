//! Wire protocol between the ptyhub server and its browser clients.
//!
//! All frames are JSON objects tagged by a `"type"` field and travel as
//! WebSocket text messages. Client frames are validated on parse; anything
//! that fails a type, presence, or bound check is silently discarded so a
//! misbehaving client cannot provoke error traffic.

use serde::{Deserialize, Serialize};

/// Opaque agent identifier, supplied by the spawning caller.
pub type AgentId = String;

/// Opaque task identifier; several agents may share one task.
pub type TaskId = String;

/// Longest accepted agent id, in bytes.
pub const MAX_AGENT_ID_BYTES: usize = 100;

/// Longest accepted `input` payload, in bytes.
pub const MAX_INPUT_BYTES: usize = 4096;

/// Terminal dimension bounds for `resize`.
pub const MIN_TERM_DIM: u16 = 1;
pub const MAX_TERM_DIM: u16 = 500;

/// Largest WebSocket message the server will accept.
pub const MAX_WS_PAYLOAD_BYTES: usize = 64 * 1024;

/// Concurrent WebSocket client cap.
pub const MAX_CLIENTS: usize = 10;

/// Frames sent by clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Raw keyboard/paste input for an agent's PTY.
    Input { agent_id: AgentId, data: String },
    /// Resize an agent's PTY.
    Resize {
        agent_id: AgentId,
        cols: u16,
        rows: u16,
    },
    /// Terminate an agent.
    Kill { agent_id: AgentId },
    /// Start receiving output for an agent.
    Subscribe { agent_id: AgentId },
    /// Stop receiving output for an agent.
    Unsubscribe { agent_id: AgentId },
}

impl ClientFrame {
    /// The agent id carried by every client frame.
    pub fn agent_id(&self) -> &str {
        match self {
            ClientFrame::Input { agent_id, .. }
            | ClientFrame::Resize { agent_id, .. }
            | ClientFrame::Kill { agent_id }
            | ClientFrame::Subscribe { agent_id }
            | ClientFrame::Unsubscribe { agent_id } => agent_id,
        }
    }

    fn bounds_ok(&self) -> bool {
        if self.agent_id().len() > MAX_AGENT_ID_BYTES {
            return false;
        }
        match self {
            ClientFrame::Input { data, .. } => data.len() <= MAX_INPUT_BYTES,
            ClientFrame::Resize { cols, rows, .. } => dim_ok(*cols) && dim_ok(*rows),
            _ => true,
        }
    }
}

fn dim_ok(dim: u16) -> bool {
    (MIN_TERM_DIM..=MAX_TERM_DIM).contains(&dim)
}

/// Parse and validate one client frame.
///
/// Returns `None` for malformed JSON, unknown types, missing or mistyped
/// fields, and bound violations. Callers drop such frames without replying.
pub fn parse_client_frame(raw: &str) -> Option<ClientFrame> {
    let frame: ClientFrame = serde_json::from_str(raw).ok()?;
    frame.bounds_ok().then_some(frame)
}

/// Frames sent by the server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// One flushed chunk of agent output, base64-encoded.
    Output { agent_id: AgentId, data: String },
    /// Scrollback snapshot sent once per subscription, before any output.
    Scrollback {
        agent_id: AgentId,
        data: String,
        cols: u16,
    },
    /// Lifecycle status change for one agent.
    Status {
        agent_id: AgentId,
        status: AgentRunState,
        exit_code: Option<i32>,
    },
    /// The full deduplicated agent list.
    Agents { list: Vec<RemoteAgent> },
}

/// Coarse agent state as shown to remote clients.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentRunState {
    Running,
    Exited,
}

/// One entry of the agent-list projection. The list holds exactly one entry
/// per task id; a running agent outranks an exited one for the same task.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAgent {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub task_name: String,
    pub status: AgentRunState,
    pub exit_code: Option<i32>,
    pub last_line: String,
}
