use super::model::{now_unix, Machine, MachineStatus, RuntimeType};
use crate::error::{Error, Result};
use sqlx::{Row, SqlitePool};

fn decode(row: sqlx::sqlite::SqliteRow) -> Result<Machine> {
    let status: String = row.try_get("status")?;
    let runtime_type: String = row.try_get("runtime_type")?;
    let pid: Option<i64> = row.try_get("pid")?;

    Ok(Machine {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: status
            .parse()
            .map_err(|e: String| Error::Runtime(format!("corrupt status in store: {e}")))?,
        runtime_type: runtime_type
            .parse()
            .map_err(|e: String| Error::Runtime(format!("corrupt runtime_type in store: {e}")))?,
        vcpu_count: row.try_get::<i64, _>("vcpu_count")? as u32,
        mem_size_mib: row.try_get::<i64, _>("mem_size_mib")? as u32,
        kernel_image_path: row.try_get("kernel_image_path")?,
        kernel_args: row.try_get("kernel_args")?,
        rootfs_path: row.try_get("rootfs_path")?,
        control_socket_path: row.try_get("control_socket_path")?,
        tap_device: row.try_get("tap_device")?,
        tap_ip: row.try_get("tap_ip")?,
        guest_ip: row.try_get("guest_ip")?,
        guest_mac: row.try_get("guest_mac")?,
        pid: pid.map(|p| p as u32),
        image_reference: row.try_get("image_reference")?,
        image_digest: row.try_get("image_digest")?,
        config: row.try_get("config")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Creates a new machine row in `pending` status.
pub async fn create(
    pool: &SqlitePool,
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
    let now = now_unix();
    sqlx::query(
        r#"
        INSERT INTO machines (
            id, name, status, runtime_type, vcpu_count, mem_size_mib,
            kernel_image_path, kernel_args, image_reference, config,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(MachineStatus::Pending.to_string())
    .bind(runtime_type.to_string())
    .bind(vcpu_count as i64)
    .bind(mem_size_mib as i64)
    .bind(kernel_image_path)
    .bind(kernel_args)
    .bind(image_reference)
    .bind(config)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get(pool, id)
        .await?
        .ok_or_else(|| Error::Runtime("machine row vanished immediately after insert".into()))
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<Machine>> {
    let row = sqlx::query("SELECT * FROM machines WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(decode).transpose()
}

pub async fn list_by_status(pool: &SqlitePool, status: MachineStatus) -> Result<Vec<Machine>> {
    let rows = sqlx::query("SELECT * FROM machines WHERE status = ?")
        .bind(status.to_string())
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(decode).collect()
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Machine>> {
    let rows = sqlx::query("SELECT * FROM machines").fetch_all(pool).await?;
    rows.into_iter().map(decode).collect()
}

/// Moves a machine to `status`, optionally recording `error_message`.
/// `updated_at` is always bumped, preserving the monotonic-timestamp
/// invariant.
pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: MachineStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE machines SET status = ?, error_message = ?, updated_at = ? WHERE id = ?")
        .bind(status.to_string())
        .bind(error_message)
        .bind(now_unix())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Records the resolved image digest and rootfs path (after C4 resolves).
pub async fn set_image_resolved(
    pool: &SqlitePool,
    id: &str,
    image_digest: &str,
    rootfs_path: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE machines SET image_digest = ?, rootfs_path = ?, updated_at = ? WHERE id = ?",
    )
    .bind(image_digest)
    .bind(rootfs_path)
    .bind(now_unix())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Records host-network resources leased for this machine (after C6).
pub async fn set_network(
    pool: &SqlitePool,
    id: &str,
    tap_device: &str,
    tap_ip: &str,
    guest_ip: &str,
    guest_mac: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE machines
        SET tap_device = ?, tap_ip = ?, guest_ip = ?, guest_mac = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(tap_device)
    .bind(tap_ip)
    .bind(guest_ip)
    .bind(guest_mac)
    .bind(now_unix())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Records that the hypervisor started successfully: control socket, pid,
/// and the `running` status together, satisfying the
/// `status=running => pid != null && tap_device != null` invariant.
pub async fn set_running(
    pool: &SqlitePool,
    id: &str,
    control_socket_path: &str,
    pid: u32,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE machines
        SET control_socket_path = ?, pid = ?, status = ?, error_message = NULL, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(control_socket_path)
    .bind(pid as i64)
    .bind(MachineStatus::Running.to_string())
    .bind(now_unix())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Clears runtime resources (pid, control socket, network) on stop/crash,
/// satisfying the `status in {stopped, failed} => pid = null` invariant.
pub async fn clear_runtime_fields(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE machines
        SET pid = NULL, control_socket_path = NULL,
            tap_device = NULL, tap_ip = NULL, guest_ip = NULL, guest_mac = NULL,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(now_unix())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM machines WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn test_store() -> Store {
        Store::open(std::path::Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = test_store().await;
        let m = create(
            store.pool(),
            "m1",
            "test-vm",
            RuntimeType::Firecracker,
            2,
            512,
            "docker.io/library/alpine:latest",
            None,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(m.status, MachineStatus::Pending);

        let fetched = get(store.pool(), "m1").await.unwrap().unwrap();
        assert_eq!(fetched.name, "test-vm");
        assert_eq!(fetched.runtime_type, RuntimeType::Firecracker);
    }

    #[tokio::test]
    async fn set_running_satisfies_invariant() {
        let store = test_store().await;
        create(
            store.pool(),
            "m2",
            "vm",
            RuntimeType::Firecracker,
            1,
            256,
            "alpine",
            None,
            None,
            None,
        )
        .await
        .unwrap();
        set_network(store.pool(), "m2", "tap0", "10.0.0.1", "10.0.0.2", "aa:bb:cc:dd:ee:ff")
            .await
            .unwrap();
        set_running(store.pool(), "m2", "/tmp/m2.sock", 12345).await.unwrap();

        let m = get(store.pool(), "m2").await.unwrap().unwrap();
        assert!(m.check_running_invariant());
        assert_eq!(m.pid, Some(12345));
    }

    #[tokio::test]
    async fn clear_runtime_fields_satisfies_terminal_invariant() {
        let store = test_store().await;
        create(
            store.pool(),
            "m3",
            "vm",
            RuntimeType::Firecracker,
            1,
            256,
            "alpine",
            None,
            None,
            None,
        )
        .await
        .unwrap();
        set_running(store.pool(), "m3", "/tmp/m3.sock", 999).await.unwrap();
        clear_runtime_fields(store.pool(), "m3").await.unwrap();
        set_status(store.pool(), "m3", MachineStatus::Stopped, None)
            .await
            .unwrap();

        let m = get(store.pool(), "m3").await.unwrap().unwrap();
        assert!(m.check_terminal_invariant());
    }
}
