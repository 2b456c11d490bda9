//! The durable data model (spec §3): `Machine` and `ApiKey` rows, plus
//! their small enum fields. SQLite has no native enum type, so each enum
//! here round-trips through a `TEXT` column via `Display`/`FromStr`,
//! validated on the way back out of the database.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Pending,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl MachineStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            MachineStatus::Pending
                | MachineStatus::Starting
                | MachineStatus::Running
                | MachineStatus::Paused
                | MachineStatus::Stopping
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MachineStatus::Stopped | MachineStatus::Failed)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineStatus::Pending => "pending",
            MachineStatus::Starting => "starting",
            MachineStatus::Running => "running",
            MachineStatus::Paused => "paused",
            MachineStatus::Stopping => "stopping",
            MachineStatus::Stopped => "stopped",
            MachineStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for MachineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => MachineStatus::Pending,
            "starting" => MachineStatus::Starting,
            "running" => MachineStatus::Running,
            "paused" => MachineStatus::Paused,
            "stopping" => MachineStatus::Stopping,
            "stopped" => MachineStatus::Stopped,
            "failed" => MachineStatus::Failed,
            other => return Err(format!("unknown machine status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    Firecracker,
    CloudHypervisor,
    Docker,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeType::Firecracker => "firecracker",
            RuntimeType::CloudHypervisor => "cloud-hypervisor",
            RuntimeType::Docker => "docker",
        };
        f.write_str(s)
    }
}

impl FromStr for RuntimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "firecracker" => RuntimeType::Firecracker,
            "cloud-hypervisor" => RuntimeType::CloudHypervisor,
            "docker" => RuntimeType::Docker,
            other => return Err(format!("unknown runtime type: {other}")),
        })
    }
}

/// The durable `Machine` row (spec §3). `id` is an opaque short token of at
/// most 16 characters.
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub status: MachineStatus,
    pub runtime_type: RuntimeType,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub kernel_image_path: Option<String>,
    pub kernel_args: Option<String>,
    pub rootfs_path: Option<String>,
    pub control_socket_path: Option<String>,
    pub tap_device: Option<String>,
    pub tap_ip: Option<String>,
    pub guest_ip: Option<String>,
    pub guest_mac: Option<String>,
    pub pid: Option<u32>,
    pub image_reference: String,
    pub image_digest: Option<String>,
    pub config: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Machine {
    /// Spec invariant: `status=running => pid != null && tap_device != null`.
    pub fn check_running_invariant(&self) -> bool {
        if self.status == MachineStatus::Running {
            self.pid.is_some() && self.tap_device.is_some()
        } else {
            true
        }
    }

    /// Spec invariant: `status in {stopped, failed} => pid = null`.
    pub fn check_terminal_invariant(&self) -> bool {
        if self.status.is_terminal() {
            self.pid.is_none()
        } else {
            true
        }
    }
}

/// An opaque API key row (spec §3). Lookup is always by exact hash.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub hash: String,
    pub public_prefix: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<i64>,
    pub revoked_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
}

impl ApiKey {
    pub fn has_scope(&self, verb: &str) -> bool {
        self.scopes.iter().any(|s| s == "*" || s == verb)
    }

    pub fn is_valid(&self, now: i64) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(exp) => now < exp,
            None => true,
        }
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_display_and_from_str() {
        for s in [
            MachineStatus::Pending,
            MachineStatus::Starting,
            MachineStatus::Running,
            MachineStatus::Paused,
            MachineStatus::Stopping,
            MachineStatus::Stopped,
            MachineStatus::Failed,
        ] {
            let back: MachineStatus = s.to_string().parse().unwrap();
            assert_eq!(back, s);
        }
    }

    #[test]
    fn api_key_wildcard_scope_matches_any_verb() {
        let key = ApiKey {
            hash: "h".into(),
            public_prefix: "p".into(),
            scopes: vec!["*".into()],
            expires_at: None,
            revoked_at: None,
            last_used_at: None,
            created_at: 0,
        };
        assert!(key.has_scope("machines:delete"));
    }
}
