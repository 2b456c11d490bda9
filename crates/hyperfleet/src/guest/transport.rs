//! C7: framed RPC to the in-guest agent over vsock. Connection-per-RPC, as
//! permitted by the wire protocol — no multiplexing, no persistent
//! connection to go stale across guest reboots.

use crate::error::{Error, Result};
use crate::resilience::{with_retry, with_timeout, CircuitBreaker, RetryOptions};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use shared::{AgentOp, AgentRequest, AgentResponse, AgentResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_vsock::{VsockAddr, VsockStream};

use super::pathdefence;

const VSOCK_AGENT_PORT: u32 = 10_000;

/// A file read back from the guest, decoded from the wire's base64 body
/// into raw bytes.
#[derive(Debug, Clone)]
pub struct ReadFile {
    pub path: String,
    pub content: Vec<u8>,
    pub size: u64,
    pub mode: u32,
}

pub struct GuestClient {
    cid: u32,
    next_id: AtomicU64,
    breaker: CircuitBreaker,
}

impl GuestClient {
    pub fn new(cid: u32) -> Self {
        Self {
            cid,
            next_id: AtomicU64::new(1),
            breaker: CircuitBreaker::new(5, 30_000, 2),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn roundtrip(&self, op: AgentOp, timeout_ms: u64) -> Result<AgentResult> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = AgentRequest { id, op };
        let cid = self.cid;

        let connect_and_call = async move {
            let mut stream = VsockStream::connect(VsockAddr::new(cid, VSOCK_AGENT_PORT))
                .await
                .map_err(|e| Error::Vsock(format!("connect failed: {e}")))?;

            shared::write_frame(&mut stream, &request)
                .await
                .map_err(|e| Error::Vsock(format!("write failed: {e}")))?;

            let response: AgentResponse = shared::read_frame(&mut stream)
                .await
                .map_err(|e| Error::Vsock(format!("read failed: {e}")))?;

            if response.id != request.id {
                return Err(Error::Vsock(format!(
                    "response id {} does not match request id {}",
                    response.id, request.id
                )));
            }

            Ok(response.outcome)
        };

        with_timeout(connect_and_call, timeout_ms, Some("guest rpc")).await
    }

    /// Runs `op` through the circuit breaker with one reconnect attempt on
    /// a transport-level `Vsock` failure. Agent-reported failures
    /// (`AgentResult::Err`) are not retried here — the caller decides.
    async fn call(&self, op: AgentOp, timeout_ms: u64) -> Result<AgentResult> {
        let retry_opts = RetryOptions { max_attempts: 2, ..RetryOptions::default() };
        self.breaker
            .call(|| async {
                with_retry(&retry_opts, |e| matches!(e, Error::Vsock(_)), || async {
                    self.roundtrip(op.clone(), timeout_ms).await
                })
                .await
            })
            .await
    }

    pub async fn exec(&self, cmd: Vec<String>, timeout_ms: u64) -> Result<shared::agent_protocol::ExecResult> {
        let outcome = self.call(AgentOp::Exec { cmd, timeout_ms }, timeout_ms).await?;
        decode(outcome)
    }

    pub async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
        timeout_ms: u64,
    ) -> Result<()> {
        pathdefence::check(path)?;
        let outcome = self
            .call(
                AgentOp::FileWrite { path: path.to_string(), content: BASE64.encode(content), mode },
                timeout_ms,
            )
            .await?;
        match outcome {
            AgentResult::Ok { .. } => Ok(()),
            AgentResult::Err { error } => Err(agent_error(error)),
        }
    }

    pub async fn read_file(&self, path: &str, timeout_ms: u64) -> Result<ReadFile> {
        pathdefence::check(path)?;
        let outcome = self.call(AgentOp::FileRead { path: path.to_string() }, timeout_ms).await?;
        let result: shared::agent_protocol::FileReadResult = decode(outcome)?;
        let content = BASE64
            .decode(&result.content)
            .map_err(|e| Error::Vsock(format!("malformed base64 file content: {e}")))?;
        Ok(ReadFile { path: result.path, content, size: result.size, mode: result.mode })
    }

    pub async fn stat_file(
        &self,
        path: &str,
        timeout_ms: u64,
    ) -> Result<shared::agent_protocol::FileStatResult> {
        pathdefence::check(path)?;
        let outcome = self.call(AgentOp::FileStat { path: path.to_string() }, timeout_ms).await?;
        decode(outcome)
    }
}

fn decode<T: serde::de::DeserializeOwned>(outcome: AgentResult) -> Result<T> {
    match outcome {
        AgentResult::Ok { value } => serde_json::from_value(value)
            .map_err(|e| Error::Vsock(format!("malformed agent response: {e}"))),
        AgentResult::Err { error } => Err(agent_error(error)),
    }
}

fn agent_error(error: shared::AgentError) -> Error {
    Error::Runtime(format!("guest agent error [{}]: {}", error.tag, error.message))
}

pub type SharedGuestClient = Arc<GuestClient>;
