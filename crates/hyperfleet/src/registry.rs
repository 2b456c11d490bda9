//! C8: the process-local runtime registry — a concurrent `id -> Runtime`
//! map. Durable status lives in C3; this map exists only so a running
//! process has somewhere to keep the live `HypervisorDriver` handle that
//! can't itself be persisted.

use crate::hypervisor::HypervisorDriver;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub type Runtime = Arc<Mutex<Box<dyn HypervisorDriver>>>;

#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Runtime>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, id: String, runtime: Runtime) {
        self.entries.write().await.insert(id, runtime);
    }

    pub async fn get(&self, id: &str) -> Option<Runtime> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Runtime> {
        self.entries.write().await.remove(id)
    }

    pub async fn has(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn list_running(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

/// Checks whether a process with `pid` is still alive, using a zero
/// signal so no actual signal is delivered (`kill(pid, 0)`).
pub fn process_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::docker::DockerDriver;

    fn fake_runtime() -> Runtime {
        Arc::new(Mutex::new(Box::new(DockerDriver::new("alpine".into()))))
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = Registry::new();
        registry.register("m1".into(), fake_runtime()).await;
        assert!(registry.has("m1").await);
        assert!(registry.get("m1").await.is_some());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn remove_drops_the_entry() {
        let registry = Registry::new();
        registry.register("m1".into(), fake_runtime()).await;
        registry.remove("m1").await;
        assert!(!registry.has("m1").await);
    }

    #[test]
    fn process_alive_is_true_for_the_current_process() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn process_alive_is_false_for_an_unlikely_pid() {
        assert!(!process_alive(u32::MAX - 1));
    }
}
