//! RPC shapes spoken between the host (C7, `hyperfleet::guest`) and the
//! guest-side agent baked into the microVM's init. Requests and responses
//! are carried one-per-frame over [`crate::protocol`].

use serde::{Deserialize, Serialize};

/// A single request sent to the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub id: u64,
    #[serde(flatten)]
    pub op: AgentOp,
}

/// The operation portion of a request, tagged by `op`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum AgentOp {
    Exec {
        cmd: Vec<String>,
        timeout_ms: u64,
    },
    FileWrite {
        path: String,
        /// Base64-encoded file content.
        content: String,
        mode: Option<u32>,
    },
    FileRead {
        path: String,
    },
    FileStat {
        path: String,
    },
}

/// A single response received from the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub id: u64,
    #[serde(flatten)]
    pub outcome: AgentResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "ok")]
pub enum AgentResult {
    #[serde(rename = "true")]
    Ok { value: serde_json::Value },
    #[serde(rename = "false")]
    Err { error: AgentError },
}

/// Structured error surfaced by the guest agent, translated by the host
/// into the C1 error taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{tag}: {message}")]
pub struct AgentError {
    pub tag: String,
    pub message: String,
}

impl AgentError {
    pub fn new(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            message: message.into(),
        }
    }
}

/// Result of a successful `exec` op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Result of a successful `file_read` op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReadResult {
    pub path: String,
    /// Base64-encoded file content.
    pub content: String,
    pub size: u64,
    pub mode: u32,
}

/// Result of a successful `file_stat` op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatResult {
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_request_round_trips_through_json() {
        let req = AgentRequest {
            id: 7,
            op: AgentOp::Exec {
                cmd: vec!["/bin/echo".into(), "hi".into()],
                timeout_ms: 5_000,
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: AgentRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 7);
        assert!(matches!(back.op, AgentOp::Exec { .. }));
    }

    #[test]
    fn error_response_carries_tag_and_message() {
        let resp = AgentResponse {
            id: 1,
            outcome: AgentResult::Err {
                error: AgentError::new("PathTraversal", "../etc/passwd escapes root"),
            },
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["ok"], "false");
        assert_eq!(json["error"]["tag"], "PathTraversal");
    }
}
