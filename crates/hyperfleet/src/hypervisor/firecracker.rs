use super::{HypervisorDriver, InstanceInfo, StartSpec};
use crate::error::{Error, Result};
use crate::guest::SharedGuestClient;
use crate::resilience::{with_retry, with_timeout, CircuitBreaker, RetryOptions};
use async_trait::async_trait;
use firecracker_sdk::builder::FirecrackerBuilder;
use firecracker_sdk::dto::{
    BootSource, Drive, MachineConfiguration, NetworkInterface, Vsock as FcVsock,
};
use firecracker_sdk::firecracker::Firecracker;
use shared::agent_protocol::ExecResult;
use std::path::PathBuf;
use std::sync::Arc;

const GRACE_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Drives a real `firecracker` binary over its control socket. Every call
/// that reaches the VMM HTTP API runs through C2's timeout/retry/breaker
/// stack; the breaker is per-instance, matching the per-endpoint
/// discipline the resilience primitives assume.
pub struct FirecrackerDriver {
    binary_path: PathBuf,
    inner: Option<Firecracker>,
    breaker: CircuitBreaker,
    guest: SharedGuestClient,
}

impl FirecrackerDriver {
    pub fn new(binary_path: PathBuf, vsock_cid: u32) -> Self {
        Self {
            binary_path,
            inner: None,
            breaker: CircuitBreaker::new(5, 30_000, 2),
            guest: Arc::new(crate::guest::GuestClient::new(vsock_cid)),
        }
    }

    fn map_sdk_error(err: firecracker_sdk::firecracker::Error) -> Error {
        use firecracker_sdk::api::ApiError;
        use firecracker_sdk::firecracker::Error as FcError;
        match err {
            FcError::Api(ApiError::Firecracker(msg)) => {
                Error::Vmm { status_code: 500, body: msg }
            }
            FcError::Api(ApiError::InvalidInput(msg)) => {
                Error::Vmm { status_code: 400, body: msg }
            }
            other => Error::Hypervisor2(other.to_string()),
        }
    }
}

#[async_trait]
impl HypervisorDriver for FirecrackerDriver {
    async fn start(&mut self, spec: &StartSpec) -> Result<u32> {
        let mut fc = FirecrackerBuilder::new(self.binary_path.clone())
            .with_api_socket_path(Some(PathBuf::from(&spec.control_socket_path)))
            .build()
            .map_err(|e| Error::Hypervisor2(e.to_string()))?;

        fc.set_boot_source(BootSource {
            kernel_image_path: spec.kernel_image_path.clone(),
            boot_args: spec.kernel_args.clone(),
            initrd_path: None,
        })
        .map_err(Self::map_sdk_error)?;

        fc.set_machine_config(MachineConfiguration {
            cpu_template: None,
            smt: None,
            mem_size_mib: spec.mem_size_mib as isize,
            track_dirty_pages: None,
            vcpu_count: spec.vcpu_count as isize,
            huge_pages: None,
        })
        .map_err(Self::map_sdk_error)?;

        fc.add_drive(Drive {
            drive_id: "rootfs".to_string(),
            partuuid: None,
            is_root_device: true,
            cache_type: None,
            is_read_only: Some(false),
            path_on_host: Some(spec.rootfs_path.clone()),
            rate_limiter: None,
            io_engine: None,
            socket: None,
        })
        .map_err(Self::map_sdk_error)?;

        fc.add_network(NetworkInterface {
            guest_mac: Some(spec.guest_mac.clone()),
            host_dev_name: spec.tap_device.clone(),
            iface_id: "eth0".to_string(),
            rx_rate_limiter: None,
            tx_rate_limiter: None,
        })
        .map_err(Self::map_sdk_error)?;

        fc.set_vsock(FcVsock {
            guest_cid: spec.vsock_cid as isize,
            uds_path: spec.vsock_uds_path.clone(),
            vsock_id: Some("vsock0".to_string()),
        })
        .map_err(Self::map_sdk_error)?;

        let socket_path = spec.control_socket_path.clone();
        let retry_opts = RetryOptions { max_attempts: 3, initial_delay_ms: 50, ..RetryOptions::default() };
        self.breaker
            .call(|| async {
                with_retry(&retry_opts, |e| e.is_transient(), || {
                    with_timeout(
                        async { fc.start(socket_path.clone()).await.map_err(Self::map_sdk_error) },
                        10_000,
                        Some("firecracker start"),
                    )
                })
                .await
            })
            .await?;

        let pid = fc.pid();
        self.inner = Some(fc);
        pid.ok_or_else(|| Error::Hypervisor2("started but no pid recorded".into()))
    }

    async fn stop(&mut self, _grace_ms: u64) -> Result<()> {
        let breaker = &self.breaker;
        let fc = self.inner.as_mut().ok_or_else(|| Error::Hypervisor2("not started".into()))?;
        breaker
            .call(|| {
                with_timeout(
                    async { fc.shutdown().await.map_err(Self::map_sdk_error) },
                    GRACE_SHUTDOWN_TIMEOUT_MS,
                    Some("firecracker shutdown"),
                )
            })
            .await
    }

    async fn pause(&mut self) -> Result<()> {
        let breaker = &self.breaker;
        let fc = self.inner.as_mut().ok_or_else(|| Error::Hypervisor2("not started".into()))?;
        breaker.call(|| async { fc.pause().await.map_err(Self::map_sdk_error) }).await
    }

    async fn resume(&mut self) -> Result<()> {
        let breaker = &self.breaker;
        let fc = self.inner.as_mut().ok_or_else(|| Error::Hypervisor2("not started".into()))?;
        breaker.call(|| async { fc.resume().await.map_err(Self::map_sdk_error) }).await
    }

    async fn exec(&self, cmd: Vec<String>, timeout_ms: u64) -> Result<ExecResult> {
        self.guest.exec(cmd, timeout_ms).await
    }

    async fn wait(&mut self) -> Result<i32> {
        let fc = self.inner.as_mut().ok_or_else(|| Error::Hypervisor2("not started".into()))?;
        let status = fc.wait().await.map_err(Self::map_sdk_error)?;
        Ok(status.code().unwrap_or(-1))
    }

    fn is_running(&self) -> bool {
        matches!(
            self.inner.as_ref().map(|fc| fc.state()),
            Some(firecracker_sdk::dto::InstanceState::Running)
                | Some(firecracker_sdk::dto::InstanceState::Paused)
        )
    }

    fn get_pid(&self) -> Option<u32> {
        self.inner.as_ref().and_then(|fc| fc.pid())
    }

    fn get_info(&self) -> InstanceInfo {
        InstanceInfo { pid: self.get_pid(), is_running: self.is_running() }
    }
}
