//! Boot-time configuration, read once from the environment (spec §6).
//! Invalid configuration is a hard boot failure: `Config::from_env` returns
//! `Err` and `main` exits non-zero rather than limping along with defaults
//! for required values.

use crate::error::{Error, Result};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub port: u16,
    pub proxy_port: u16,
    pub proxy_prefix: String,
    pub proxy_host_suffix: String,
    pub proxy_exposed_port_poll_interval_ms: u64,
    pub init_path: PathBuf,
    pub oci_cache_dir: PathBuf,
    pub oci_max_cache_size_bytes: u64,
    pub oci_default_rootfs_size_mib: u32,
    pub firecracker_binary_path: PathBuf,
    pub cloud_hypervisor_binary_path: PathBuf,
    pub network_bridge_name: String,
    pub vsock_socket_dir: PathBuf,
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Validation(format!("missing required env var {name}")))
}

fn env_var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_u16(name: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::Validation(format!("{name} must be a valid port number, got {value:?}")))
}

fn parse_u64(name: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::Validation(format!("{name} must be a non-negative integer, got {value:?}")))
}

fn parse_u32(name: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| Error::Validation(format!("{name} must be a non-negative integer, got {value:?}")))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_path = PathBuf::from(env_var("DATABASE_PATH")?);
        let port = parse_u16("PORT", &env_var("PORT")?)?;
        let proxy_port = parse_u16("PROXY_PORT", &env_var("PROXY_PORT")?)?;
        let proxy_prefix = env_var_or("PROXY_PREFIX", "vm");
        let proxy_host_suffix = env_var_or("PROXY_HOST_SUFFIX", "");
        let poll_raw = env_var_or("PROXY_EXPOSED_PORT_POLL_INTERVAL_MS", "250");
        let proxy_exposed_port_poll_interval_ms =
            parse_u64("PROXY_EXPOSED_PORT_POLL_INTERVAL_MS", &poll_raw)?;
        let init_path = PathBuf::from(env_var("HYPERFLEET_INIT_PATH")?);
        let oci_cache_dir = PathBuf::from(env_var("HYPERFLEET_OCI_CACHE_DIR")?);
        let max_cache_raw =
            env_var_or("HYPERFLEET_OCI_MAX_CACHE_SIZE", &(10u64 * 1024 * 1024 * 1024).to_string());
        let oci_max_cache_size_bytes =
            parse_u64("HYPERFLEET_OCI_MAX_CACHE_SIZE", &max_cache_raw)?;
        let default_size_raw = env_var_or("HYPERFLEET_OCI_DEFAULT_ROOTFS_SIZE_MIB", "1024");
        let oci_default_rootfs_size_mib =
            parse_u32("HYPERFLEET_OCI_DEFAULT_ROOTFS_SIZE_MIB", &default_size_raw)?;

        if oci_default_rootfs_size_mib == 0 {
            return Err(Error::Validation(
                "HYPERFLEET_OCI_DEFAULT_ROOTFS_SIZE_MIB must be greater than zero".into(),
            ));
        }

        let firecracker_binary_path = PathBuf::from(env_var_or("HYPERFLEET_FIRECRACKER_BIN", "firecracker"));
        let cloud_hypervisor_binary_path =
            PathBuf::from(env_var_or("HYPERFLEET_CLOUD_HYPERVISOR_BIN", "cloud-hypervisor"));
        let network_bridge_name = env_var_or("HYPERFLEET_NETWORK_BRIDGE", "hfbr0");
        let vsock_socket_dir = PathBuf::from(env_var_or("HYPERFLEET_VSOCK_SOCKET_DIR", "/var/lib/hyperfleet/vsock"));

        Ok(Config {
            database_path,
            port,
            proxy_port,
            proxy_prefix,
            proxy_host_suffix,
            proxy_exposed_port_poll_interval_ms,
            init_path,
            oci_cache_dir,
            oci_max_cache_size_bytes,
            oci_default_rootfs_size_mib,
            firecracker_binary_path,
            cloud_hypervisor_binary_path,
            network_bridge_name,
            vsock_socket_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for var in [
            "DATABASE_PATH",
            "PORT",
            "PROXY_PORT",
            "PROXY_PREFIX",
            "PROXY_HOST_SUFFIX",
            "PROXY_EXPOSED_PORT_POLL_INTERVAL_MS",
            "HYPERFLEET_INIT_PATH",
            "HYPERFLEET_OCI_CACHE_DIR",
            "HYPERFLEET_OCI_MAX_CACHE_SIZE",
            "HYPERFLEET_OCI_DEFAULT_ROOTFS_SIZE_MIB",
        ] {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn missing_required_var_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn full_env_parses_with_defaults_for_optional_vars() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var("DATABASE_PATH", "/tmp/hyperfleet.db");
            std::env::set_var("PORT", "8080");
            std::env::set_var("PROXY_PORT", "8081");
            std::env::set_var("HYPERFLEET_INIT_PATH", "/opt/hyperfleet/init");
            std::env::set_var("HYPERFLEET_OCI_CACHE_DIR", "/var/cache/hyperfleet");
        }
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.proxy_prefix, "vm");
        assert_eq!(cfg.oci_default_rootfs_size_mib, 1024);
    }

    #[test]
    fn zero_default_rootfs_size_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe {
            std::env::set_var("DATABASE_PATH", "/tmp/hyperfleet.db");
            std::env::set_var("PORT", "8080");
            std::env::set_var("PROXY_PORT", "8081");
            std::env::set_var("HYPERFLEET_INIT_PATH", "/opt/hyperfleet/init");
            std::env::set_var("HYPERFLEET_OCI_CACHE_DIR", "/var/cache/hyperfleet");
            std::env::set_var("HYPERFLEET_OCI_DEFAULT_ROOTFS_SIZE_MIB", "0");
        }
        assert!(Config::from_env().is_err());
    }
}
