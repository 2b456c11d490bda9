//! C6: host network resources — tap device, bridge attachment, IP
//! allocation, and NAT rules. All of it is `ip`/`iptables` shellouts kept
//! behind a narrow `CommandExecutor` so tests can inject a fake one
//! instead of touching the real network stack (spec §9 design note).

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

pub struct ShellExecutor;

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("failed to spawn {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_idempotent_failure(&stderr) {
                return Ok(stderr);
            }
            return Err(Error::Runtime(format!("{program} {args:?} failed: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// `ip`/`iptables` report "already exists"-shaped errors on repeat
/// invocations of an operation that already succeeded; creation and rule
/// installation are expected to be idempotent, so these are not failures.
fn is_idempotent_failure(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("file exists") || lowered.contains("already a member of")
}

#[derive(Debug, Clone)]
pub struct LeasedNetwork {
    pub tap_device: String,
    pub tap_ip: String,
    pub guest_ip: String,
    pub guest_mac: String,
}

/// Allocates tap devices and IPs out of a private `/24` (spec leaves the
/// exact addressing scheme unspecified); `next_octet` hands out a fresh
/// third octet per machine for both host and guest endpoints of a /30.
pub struct NetworkManager {
    executor: Box<dyn CommandExecutor>,
    bridge_name: String,
    base_octet: AtomicU32,
}

impl NetworkManager {
    pub fn new(executor: Box<dyn CommandExecutor>, bridge_name: impl Into<String>) -> Self {
        Self { executor, bridge_name: bridge_name.into(), base_octet: AtomicU32::new(0) }
    }

    fn next_subnet(&self) -> (Ipv4Addr, Ipv4Addr) {
        let octet = self.base_octet.fetch_add(1, Ordering::Relaxed) % 250 + 1;
        let host = Ipv4Addr::new(172, 16, octet as u8, 1);
        let guest = Ipv4Addr::new(172, 16, octet as u8, 2);
        (host, guest)
    }

    fn derive_mac(tap_device: &str) -> String {
        let mut bytes = [0u8; 3];
        for (i, b) in tap_device.bytes().rev().take(3).enumerate() {
            bytes[i] = b;
        }
        format!("02:fc:00:{:02x}:{:02x}:{:02x}", bytes[2], bytes[1], bytes[0])
    }

    /// Creates a tap device, attaches it to the bridge, assigns a host-side
    /// IP, and installs MASQUERADE/FORWARD rules. All steps are idempotent
    /// so a crash-recovery retry is safe.
    pub async fn lease(&self, machine_id: &str) -> Result<LeasedNetwork> {
        let tap_device = format!("tap-{}", &machine_id[..machine_id.len().min(10)]);
        let (host_ip, guest_ip) = self.next_subnet();
        let guest_mac = Self::derive_mac(&tap_device);

        self.executor
            .run("ip", &["tuntap", "add", "dev", &tap_device, "mode", "tap"])
            .await?;
        self.executor.run("ip", &["link", "set", &tap_device, "up"]).await?;
        self.executor
            .run("ip", &["addr", "add", &format!("{host_ip}/30"), "dev", &tap_device])
            .await?;
        self.executor
            .run("ip", &["link", "set", &tap_device, "master", &self.bridge_name])
            .await?;

        self.executor
            .run(
                "iptables",
                &[
                    "-t",
                    "nat",
                    "-A",
                    "POSTROUTING",
                    "-s",
                    &format!("{guest_ip}/32"),
                    "-j",
                    "MASQUERADE",
                ],
            )
            .await?;
        self.executor
            .run("iptables", &["-A", "FORWARD", "-i", &tap_device, "-j", "ACCEPT"])
            .await?;
        self.executor
            .run("iptables", &["-A", "FORWARD", "-o", &tap_device, "-j", "ACCEPT"])
            .await?;

        Ok(LeasedNetwork {
            tap_device,
            tap_ip: host_ip.to_string(),
            guest_ip: guest_ip.to_string(),
            guest_mac,
        })
    }

    /// Tears down a previously leased tap device and its rules. Failures
    /// on any one step are logged by the caller and do not stop the rest
    /// of teardown from proceeding.
    pub async fn release(&self, leased: &LeasedNetwork) -> Result<()> {
        let _ = self
            .executor
            .run(
                "iptables",
                &["-D", "FORWARD", "-i", &leased.tap_device, "-j", "ACCEPT"],
            )
            .await;
        let _ = self
            .executor
            .run(
                "iptables",
                &["-D", "FORWARD", "-o", &leased.tap_device, "-j", "ACCEPT"],
            )
            .await;
        let _ = self
            .executor
            .run(
                "iptables",
                &[
                    "-t",
                    "nat",
                    "-D",
                    "POSTROUTING",
                    "-s",
                    &format!("{}/32", leased.guest_ip),
                    "-j",
                    "MASQUERADE",
                ],
            )
            .await;
        self.executor.run("ip", &["link", "delete", &leased.tap_device]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeExecutor {
        calls: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl FakeExecutor {
        fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()), fail_on: None }
        }
    }

    #[async_trait]
    impl CommandExecutor for FakeExecutor {
        async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
            let line = format!("{program} {}", args.join(" "));
            self.calls.lock().unwrap().push(line.clone());
            if let Some(needle) = self.fail_on {
                if line.contains(needle) {
                    return Err(Error::Runtime("simulated failure".into()));
                }
            }
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn lease_issues_distinct_tap_devices_and_subnets() {
        let manager = NetworkManager::new(Box::new(FakeExecutor::new()), "hfbr0".into());
        let a = manager.lease("m1").await.unwrap();
        let b = manager.lease("m2").await.unwrap();
        assert_ne!(a.tap_device, b.tap_device);
        assert_ne!(a.guest_ip, b.guest_ip);
    }

    #[tokio::test]
    async fn lease_propagates_a_real_failure() {
        let mut fake = FakeExecutor::new();
        fake.fail_on = Some("tuntap add");
        let manager = NetworkManager::new(Box::new(fake), "hfbr0".into());
        assert!(manager.lease("m1").await.is_err());
    }

    #[test]
    fn idempotent_failures_are_not_treated_as_errors() {
        assert!(is_idempotent_failure("RTNETLINK answers: File exists"));
        assert!(is_idempotent_failure("device tap0 is already a member of a bridge"));
        assert!(!is_idempotent_failure("Operation not permitted"));
    }
}
