//! Cloud Hypervisor backend: a small UDS REST client in the same shape as
//! `firecracker_sdk::api`, built directly on `hyper`/`hyperlocal` because
//! Cloud Hypervisor's endpoint set (`vm.create`, `vm.boot`, `vm.shutdown`,
//! `vm.pause`, `vm.resume`) doesn't match Firecracker's and isn't worth
//! threading through the same DTOs.

use super::{HypervisorDriver, InstanceInfo, StartSpec};
use crate::error::{Error, Result};
use crate::guest::SharedGuestClient;
use crate::resilience::{with_retry, with_timeout, CircuitBreaker, RetryOptions};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::Serialize;
use shared::agent_protocol::ExecResult;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::{Child, Command};

pub struct CloudHypervisorDriver {
    binary_path: PathBuf,
    control_socket_path: Option<PathBuf>,
    client: Client<UnixConnector, Full<Bytes>>,
    process: Option<Child>,
    breaker: CircuitBreaker,
    guest: SharedGuestClient,
    running: bool,
}

#[derive(Serialize)]
struct VmCreatePayload {
    kernel: PathBuf,
    cmdline: Option<String>,
    cpus: CpuConfig,
    memory: MemoryConfig,
    disks: Vec<DiskConfig>,
    net: Vec<NetConfig>,
    vsock: VsockConfig,
}

#[derive(Serialize)]
struct CpuConfig {
    boot_vcpus: u32,
    max_vcpus: u32,
}

#[derive(Serialize)]
struct MemoryConfig {
    size: u64,
}

#[derive(Serialize)]
struct DiskConfig {
    path: PathBuf,
}

#[derive(Serialize)]
struct NetConfig {
    tap: String,
    mac: String,
}

#[derive(Serialize)]
struct VsockConfig {
    cid: u32,
    socket: PathBuf,
}

impl CloudHypervisorDriver {
    pub fn new(binary_path: PathBuf, vsock_cid: u32) -> Self {
        Self {
            binary_path,
            control_socket_path: None,
            client: Client::unix(),
            process: None,
            breaker: CircuitBreaker::new(5, 30_000, 2),
            guest: Arc::new(crate::guest::GuestClient::new(vsock_cid)),
            running: false,
        }
    }

    async fn post(&self, path: &str, body: impl Serialize) -> Result<()> {
        let socket = self
            .control_socket_path
            .as_ref()
            .ok_or_else(|| Error::Hypervisor2("not started".into()))?;
        let bytes = serde_json::to_vec(&body)
            .map_err(|e| Error::Hypervisor2(format!("encode request: {e}")))?;
        let uri: hyper::Uri = UnixUri::new(socket, path).into();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .map_err(|e| Error::Hypervisor2(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| Error::Vmm { status_code: 502, body: e.to_string() })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT || status.is_success() {
            return Ok(());
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map(|b| String::from_utf8_lossy(&b.to_bytes()).to_string())
            .unwrap_or_default();
        if status.is_client_error() {
            Err(Error::Vmm { status_code: 400, body })
        } else {
            Err(Error::Vmm { status_code: 502, body })
        }
    }
}

#[async_trait]
impl HypervisorDriver for CloudHypervisorDriver {
    async fn start(&mut self, spec: &StartSpec) -> Result<u32> {
        let socket_path = PathBuf::from(&spec.control_socket_path);
        let child = Command::new(&self.binary_path)
            .arg("--api-socket")
            .arg(&socket_path)
            .spawn()
            .map_err(|e| Error::Hypervisor2(format!("spawn cloud-hypervisor: {e}")))?;
        let pid = child.id().ok_or_else(|| Error::Hypervisor2("spawned process has no pid".into()))?;
        self.process = Some(child);
        self.control_socket_path = Some(socket_path);

        for _ in 0..50 {
            if tokio::net::UnixStream::connect(self.control_socket_path.as_ref().unwrap())
                .await
                .is_ok()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let payload = VmCreatePayload {
            kernel: PathBuf::from(&spec.kernel_image_path),
            cmdline: spec.kernel_args.clone(),
            cpus: CpuConfig { boot_vcpus: spec.vcpu_count, max_vcpus: spec.vcpu_count },
            memory: MemoryConfig { size: spec.mem_size_mib as u64 * 1024 * 1024 },
            disks: vec![DiskConfig { path: PathBuf::from(&spec.rootfs_path) }],
            net: vec![NetConfig { tap: spec.tap_device.clone(), mac: spec.guest_mac.clone() }],
            vsock: VsockConfig { cid: spec.vsock_cid, socket: PathBuf::from(&spec.vsock_uds_path) },
        };

        let retry_opts = RetryOptions { max_attempts: 3, initial_delay_ms: 50, ..RetryOptions::default() };
        self.breaker
            .call(|| async {
                with_retry(&retry_opts, |e| e.is_transient(), || {
                    with_timeout(self.post("/api/v1/vm.create", &payload), 10_000, Some("vm.create"))
                })
                .await
            })
            .await?;

        self.post("/api/v1/vm.boot", serde_json::json!({})).await?;
        self.running = true;
        Ok(pid)
    }

    async fn stop(&mut self, grace_ms: u64) -> Result<()> {
        let _ = with_timeout(
            self.post("/api/v1/vm.shutdown", serde_json::json!({})),
            grace_ms,
            Some("vm.shutdown"),
        )
        .await;

        if let Some(mut process) = self.process.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_millis(grace_ms), process.wait()).await;
            let _ = process.start_kill();
        }
        self.running = false;
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        self.post("/api/v1/vm.pause", serde_json::json!({})).await
    }

    async fn resume(&mut self) -> Result<()> {
        self.post("/api/v1/vm.resume", serde_json::json!({})).await
    }

    async fn exec(&self, cmd: Vec<String>, timeout_ms: u64) -> Result<ExecResult> {
        self.guest.exec(cmd, timeout_ms).await
    }

    async fn wait(&mut self) -> Result<i32> {
        if let Some(process) = self.process.as_mut() {
            let status = process.wait().await.map_err(|e| Error::Hypervisor2(e.to_string()))?;
            self.running = false;
            Ok(status.code().unwrap_or(-1))
        } else {
            Err(Error::Hypervisor2("not started".into()))
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn get_pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|c| c.id())
    }

    fn get_info(&self) -> InstanceInfo {
        InstanceInfo { pid: self.get_pid(), is_running: self.is_running() }
    }
}
