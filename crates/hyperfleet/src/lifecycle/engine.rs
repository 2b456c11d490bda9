use crate::config::Config;
use crate::error::{Error, Result};
use crate::hypervisor::cloud_hypervisor::CloudHypervisorDriver;
use crate::hypervisor::docker::DockerDriver;
use crate::hypervisor::firecracker::FirecrackerDriver;
use crate::hypervisor::{HypervisorDriver, StartSpec};
use crate::network::{LeasedNetwork, NetworkManager};
use crate::oci::Resolver;
use crate::registry::Registry;
use crate::store::model::{Machine, MachineStatus, RuntimeType};
use crate::store::{machines, Store};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// The smallest free vsock CID; 0-2 are reserved by the hypervisor/host/any.
const FIRST_VSOCK_CID: u32 = 3;

pub struct Engine {
    store: Store,
    resolver: Arc<Resolver>,
    network: Arc<NetworkManager>,
    pub registry: Arc<Registry>,
    config: Config,
    machine_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_vsock_cid: AtomicU32,
}

impl Engine {
    pub fn new(store: Store, resolver: Arc<Resolver>, network: Arc<NetworkManager>, registry: Arc<Registry>, config: Config) -> Self {
        Self {
            store,
            resolver,
            network,
            registry,
            config,
            machine_locks: Mutex::new(HashMap::new()),
            next_vsock_cid: AtomicU32::new(FIRST_VSOCK_CID),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn lock_for(&self, machine_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.machine_locks.lock().await;
        locks.entry(machine_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn next_cid(&self) -> u32 {
        self.next_vsock_cid.fetch_add(1, Ordering::Relaxed)
    }

    fn build_driver(&self, machine: &Machine, vsock_cid: u32) -> Box<dyn HypervisorDriver> {
        match machine.runtime_type {
            RuntimeType::Firecracker => {
                Box::new(FirecrackerDriver::new(self.config.firecracker_binary_path.clone(), vsock_cid))
            }
            RuntimeType::CloudHypervisor => {
                Box::new(CloudHypervisorDriver::new(self.config.cloud_hypervisor_binary_path.clone(), vsock_cid))
            }
            RuntimeType::Docker => Box::new(DockerDriver::new(machine.image_reference.clone())),
        }
    }

    /// Creates a new row in `pending` status. Does not start it — callers
    /// that want immediate start call [`Engine::start`] afterwards.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        id: &str,
        name: &str,
        runtime_type: RuntimeType,
        vcpu_count: u32,
        mem_size_mib: u32,
        image_reference: &str,
        kernel_image_path: Option<&str>,
        kernel_args: Option<&str>,
        config: Option<&str>,
    ) -> Result<Machine> {
        if vcpu_count == 0 {
            return Err(Error::Validation("vcpu_count must be at least 1".into()));
        }
        if mem_size_mib == 0 {
            return Err(Error::Validation("mem_size_mib must be at least 1".into()));
        }
        if runtime_type != RuntimeType::Docker && kernel_image_path.is_none() {
            return Err(Error::Validation("kernel_image_path is required for VM-backed runtimes".into()));
        }

        machines::create(
            self.store.pool(),
            id,
            name,
            runtime_type,
            vcpu_count,
            mem_size_mib,
            image_reference,
            kernel_image_path,
            kernel_args,
            config,
        )
        .await
    }

    /// Runs the `start` pipeline (spec §4.8). `image_size_mib_override` is
    /// honored only if this reference hasn't been converted into the cache
    /// yet; later calls reuse whatever rootfs is already cached.
    pub async fn start(&self, machine_id: &str, image_size_mib_override: Option<u32>) -> Result<()> {
        let lock = self.lock_for(machine_id).await;
        let _guard = lock.lock().await;

        let machine = self
            .get(machine_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("machine {machine_id}")))?;

        if !matches!(machine.status, MachineStatus::Pending | MachineStatus::Stopped) {
            return Err(Error::Validation(format!(
                "cannot start machine {machine_id} from status {}",
                machine.status
            )));
        }

        machines::set_status(self.store.pool(), machine_id, MachineStatus::Starting, None).await?;

        if let Err(e) = self.run_start_pipeline(&machine, image_size_mib_override).await {
            warn!(machine_id, error = %e, "start pipeline failed, rolling back");
            machines::set_status(self.store.pool(), machine_id, MachineStatus::Failed, Some(&e.to_string())).await?;
            return Err(e);
        }

        Ok(())
    }

    async fn run_start_pipeline(&self, machine: &Machine, image_size_mib_override: Option<u32>) -> Result<()> {
        let resolved = self.resolver.resolve(&machine.image_reference, image_size_mib_override).await?;
        machines::set_image_resolved(
            self.store.pool(),
            &machine.id,
            &resolved.digest,
            &resolved.rootfs_path.to_string_lossy(),
        )
        .await?;

        let leased = self.network.lease(&machine.id).await?;
        machines::set_network(
            self.store.pool(),
            &machine.id,
            &leased.tap_device,
            &leased.tap_ip,
            &leased.guest_ip,
            &leased.guest_mac,
        )
        .await?;

        if let Err(e) = self.boot_driver(machine, &resolved.rootfs_path, &leased).await {
            let _ = self.network.release(&leased).await;
            return Err(e);
        }

        Ok(())
    }

    async fn boot_driver(
        &self,
        machine: &Machine,
        rootfs_path: &std::path::Path,
        leased: &LeasedNetwork,
    ) -> Result<()> {
        let vsock_cid = self.next_cid();
        let control_socket_path = format!("/var/lib/hyperfleet/sockets/{}.sock", machine.id);
        let vsock_uds_path = self.config.vsock_socket_dir.join(format!("{}-vsock.sock", machine.id));

        let spec = StartSpec {
            control_socket_path: control_socket_path.clone(),
            kernel_image_path: machine.kernel_image_path.clone().unwrap_or_default(),
            kernel_args: machine.kernel_args.clone(),
            rootfs_path: rootfs_path.to_string_lossy().to_string(),
            vcpu_count: machine.vcpu_count,
            mem_size_mib: machine.mem_size_mib,
            tap_device: leased.tap_device.clone(),
            guest_mac: leased.guest_mac.clone(),
            vsock_cid,
            vsock_uds_path: vsock_uds_path.to_string_lossy().to_string(),
        };

        let mut driver = self.build_driver(machine, vsock_cid);
        let pid = driver.start(&spec).await?;

        machines::set_running(self.store.pool(), &machine.id, &control_socket_path, pid).await?;
        self.registry.register(machine.id.clone(), Arc::new(tokio::sync::Mutex::new(driver))).await;
        info!(machine_id = %machine.id, pid, "machine started");
        Ok(())
    }

    /// Runs the `stop` pipeline (spec §4.8).
    pub async fn stop(&self, machine_id: &str, grace_ms: u64) -> Result<()> {
        let lock = self.lock_for(machine_id).await;
        let _guard = lock.lock().await;

        let machine = self
            .get(machine_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("machine {machine_id}")))?;

        if !matches!(machine.status, MachineStatus::Running | MachineStatus::Paused) {
            return Err(Error::Validation(format!(
                "cannot stop machine {machine_id} from status {}",
                machine.status
            )));
        }

        machines::set_status(self.store.pool(), machine_id, MachineStatus::Stopping, None).await?;

        if let Some(runtime) = self.registry.remove(machine_id).await {
            let mut driver = runtime.lock().await;
            if let Err(e) = driver.stop(grace_ms).await {
                warn!(machine_id, error = %e, "driver stop reported an error, proceeding with teardown anyway");
            }
        }

        if let (Some(tap_device), Some(guest_ip), Some(guest_mac)) =
            (&machine.tap_device, &machine.guest_ip, &machine.guest_mac)
        {
            let leased = LeasedNetwork {
                tap_device: tap_device.clone(),
                tap_ip: machine.tap_ip.clone().unwrap_or_default(),
                guest_ip: guest_ip.clone(),
                guest_mac: guest_mac.clone(),
            };
            if let Err(e) = self.network.release(&leased).await {
                warn!(machine_id, error = %e, "network release failed during stop");
            }
        }

        machines::clear_runtime_fields(self.store.pool(), machine_id).await?;
        machines::set_status(self.store.pool(), machine_id, MachineStatus::Stopped, None).await?;
        Ok(())
    }

    pub async fn pause(&self, machine_id: &str) -> Result<()> {
        let lock = self.lock_for(machine_id).await;
        let _guard = lock.lock().await;

        let machine = self
            .get(machine_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("machine {machine_id}")))?;
        if machine.status != MachineStatus::Running {
            return Err(Error::Validation(format!("cannot pause machine {machine_id} from status {}", machine.status)));
        }

        let runtime =
            self.registry.get(machine_id).await.ok_or_else(|| Error::Runtime("running machine missing from registry".into()))?;
        runtime.lock().await.pause().await?;
        machines::set_status(self.store.pool(), machine_id, MachineStatus::Paused, None).await?;
        Ok(())
    }

    pub async fn resume(&self, machine_id: &str) -> Result<()> {
        let lock = self.lock_for(machine_id).await;
        let _guard = lock.lock().await;

        let machine = self
            .get(machine_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("machine {machine_id}")))?;
        if machine.status != MachineStatus::Paused {
            return Err(Error::Validation(format!("cannot resume machine {machine_id} from status {}", machine.status)));
        }

        let runtime =
            self.registry.get(machine_id).await.ok_or_else(|| Error::Runtime("paused machine missing from registry".into()))?;
        runtime.lock().await.resume().await?;
        machines::set_status(self.store.pool(), machine_id, MachineStatus::Running, None).await?;
        Ok(())
    }

    /// Removes a machine row. Permitted only from non-active states; the
    /// cached image backing `rootfs_path` is never deleted here.
    pub async fn delete(&self, machine_id: &str) -> Result<()> {
        let lock = self.lock_for(machine_id).await;
        let _guard = lock.lock().await;

        let machine = self
            .get(machine_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("machine {machine_id}")))?;
        if machine.status.is_active() {
            return Err(Error::Validation(format!("cannot delete machine {machine_id} while status is {}", machine.status)));
        }

        if let Some(control_socket_path) = &machine.control_socket_path {
            let _ = tokio::fs::remove_file(control_socket_path).await;
        }

        machines::delete(self.store.pool(), machine_id).await
    }

    pub async fn get(&self, machine_id: &str) -> Result<Option<Machine>> {
        machines::get(self.store.pool(), machine_id).await
    }

    pub async fn list(&self) -> Result<Vec<Machine>> {
        machines::list_all(self.store.pool()).await
    }

    /// Observes that the backing process for `machine_id` exited while the
    /// store still says `running`; transitions it to `failed` recording
    /// the exit code, and unregisters it.
    pub async fn observe_crash(&self, machine_id: &str, exit_code: i32) -> Result<()> {
        let lock = self.lock_for(machine_id).await;
        let _guard = lock.lock().await;

        self.registry.remove(machine_id).await;
        let Some(machine) = self.get(machine_id).await? else {
            return Ok(());
        };
        if machine.status != MachineStatus::Running {
            return Ok(());
        }

        error!(machine_id, exit_code, "machine process exited unexpectedly");
        machines::clear_runtime_fields(self.store.pool(), machine_id).await?;
        machines::set_status(
            self.store.pool(),
            machine_id,
            MachineStatus::Failed,
            Some(&format!("guest process exited with code {exit_code}")),
        )
        .await
    }

    /// Rebuilds the runtime registry on boot (spec §4.7): every row that
    /// claims to be `running` gets its PID probed; unreachable PIDs move
    /// the row to `failed` instead of being re-registered, since their
    /// live driver handle is unrecoverable after a process restart.
    pub async fn rebuild_registry_on_boot(&self) -> Result<()> {
        let running = machines::list_by_status(self.store.pool(), MachineStatus::Running).await?;
        for machine in running {
            let alive = machine.pid.is_some_and(crate::registry::process_alive);
            if alive {
                warn!(
                    machine_id = %machine.id,
                    pid = ?machine.pid,
                    "found a live process from a previous boot with no recoverable driver handle; marking failed"
                );
            }
            machines::clear_runtime_fields(self.store.pool(), &machine.id).await?;
            machines::set_status(
                self.store.pool(),
                &machine.id,
                MachineStatus::Failed,
                Some("process restarted; prior runtime state is unrecoverable"),
            )
            .await?;
        }
        Ok(())
    }
}
