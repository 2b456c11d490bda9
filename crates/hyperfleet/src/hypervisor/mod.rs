//! C5: hypervisor drivers. One `HypervisorDriver` implementation per
//! `RuntimeType` (spec §3), each wrapping its own control surface (a VMM
//! UDS API, or the Docker CLI) behind the same narrow contract.
pub mod cloud_hypervisor;
pub mod docker;
pub mod firecracker;

use crate::error::Result;
use async_trait::async_trait;
use shared::agent_protocol::ExecResult;

/// A prepared set of resources the lifecycle engine hands to a driver's
/// `start()`: everything resolved by C3/C4/C6 ahead of time.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub control_socket_path: String,
    pub kernel_image_path: String,
    pub kernel_args: Option<String>,
    pub rootfs_path: String,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub tap_device: String,
    pub guest_mac: String,
    pub vsock_cid: u32,
    pub vsock_uds_path: String,
}

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub pid: Option<u32>,
    pub is_running: bool,
}

/// Public contract for a micro-VM/container backend (spec §4.4). Every
/// method that reaches the backend's control surface is expected to be
/// wrapped by the caller with C2's timeout/retry/breaker stack; drivers
/// themselves stay free of resilience policy so that policy can be tuned
/// centrally.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Spawns the backend process and drives it to a running instance.
    /// Returns the host PID on success.
    async fn start(&mut self, spec: &StartSpec) -> Result<u32>;

    /// Requests a graceful shutdown, then forces termination after a
    /// grace window.
    async fn stop(&mut self, grace_ms: u64) -> Result<()>;

    async fn pause(&mut self) -> Result<()>;

    async fn resume(&mut self) -> Result<()>;

    /// Runs `cmd` inside the guest via C7, enforcing `timeout_ms`.
    async fn exec(&self, cmd: Vec<String>, timeout_ms: u64) -> Result<ExecResult>;

    /// Blocks until the backend process exits, returning its exit code.
    async fn wait(&mut self) -> Result<i32>;

    fn is_running(&self) -> bool;

    fn get_pid(&self) -> Option<u32>;

    fn get_info(&self) -> InstanceInfo;
}
