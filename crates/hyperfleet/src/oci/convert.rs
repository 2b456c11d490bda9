//! Layer unpacking and rootfs image construction (spec §4.3 steps b-f):
//! untar every pulled layer into a staging directory, inject the guest
//! init binary, seed DNS, then format the tree into a sparse ext4 file.
//! Tar extraction follows the same spawn_blocking-for-CPU-bound-I/O shape
//! the teacher uses for other heavyweight synchronous work; the `mke2fs`
//! shellout follows the `tokio::process::Command` convention already used
//! by the network and Docker-backend modules.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const RESOLV_CONF_FALLBACK: &str = "nameserver 8.8.8.8\nnameserver 1.1.1.1\n";

fn reference_context(reference: &str, cause: impl std::fmt::Display) -> Error {
    Error::ImageConvert { reference: reference.to_string(), cause: cause.to_string() }
}

/// Extracts one layer tarball into `rootfs_dir`. Layers may or may not be
/// gzip-compressed; a failed gzip-header sniff falls back to a plain tar
/// stream rather than erroring, since OCI layers are conventionally
/// `.tar.gz` but the media type isn't re-validated here.
fn extract_layer(layer_path: &Path, rootfs_dir: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(layer_path)?;
    let mut peek = [0u8; 2];
    let mut buffered = std::io::BufReader::new(file);
    let peeked = {
        use std::io::BufRead;
        let buf = buffered.fill_buf()?;
        let n = buf.len().min(2);
        peek[..n].copy_from_slice(&buf[..n]);
        n
    };
    let is_gzip = peeked == 2 && peek == [0x1f, 0x8b];

    if is_gzip {
        let decoder = GzDecoder::new(buffered);
        tar::Archive::new(decoder).unpack(rootfs_dir)
    } else {
        tar::Archive::new(buffered).unpack(rootfs_dir)
    }
}

/// Unpacks every layer into `rootfs_dir`, in order, so later layers can
/// overwrite earlier ones per OCI layering semantics.
pub async fn unpack_layers(reference: &str, layer_paths: &[PathBuf], rootfs_dir: PathBuf) -> Result<()> {
    tokio::fs::create_dir_all(&rootfs_dir).await?;
    let layer_paths = layer_paths.to_vec();
    let reference = reference.to_string();
    tokio::task::spawn_blocking(move || {
        for layer_path in &layer_paths {
            extract_layer(layer_path, &rootfs_dir).map_err(|e| reference_context(&reference, e))?;
        }
        Ok::<(), Error>(())
    })
    .await
    .map_err(|e| reference_context(&reference, e))??;
    Ok(())
}

/// Copies `init_path` into `rootfs_dir/init` with mode 0755, overwriting
/// any `/init` the image itself shipped.
pub async fn inject_init(reference: &str, rootfs_dir: &Path, init_path: &Path) -> Result<()> {
    let dest = rootfs_dir.join("init");
    tokio::fs::copy(init_path, &dest).await.map_err(|e| reference_context(reference, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| reference_context(reference, e))?;
    }

    Ok(())
}

/// Writes a DNS fallback so guests without their own resolver config can
/// still reach the network.
pub async fn write_resolv_conf(reference: &str, rootfs_dir: &Path) -> Result<()> {
    let etc = rootfs_dir.join("etc");
    tokio::fs::create_dir_all(&etc).await.map_err(|e| reference_context(reference, e))?;
    tokio::fs::write(etc.join("resolv.conf"), RESOLV_CONF_FALLBACK)
        .await
        .map_err(|e| reference_context(reference, e))
}

/// Creates a sparse file of `size_mib` MiB and formats it as ext4,
/// populated from `rootfs_dir`, via `mke2fs -d`.
pub async fn build_ext4_image(reference: &str, rootfs_dir: &Path, image_path: &Path, size_mib: u32) -> Result<()> {
    let file = tokio::fs::File::create(image_path).await.map_err(|e| reference_context(reference, e))?;
    let size_bytes = u64::from(size_mib) * 1024 * 1024;
    file.set_len(size_bytes).await.map_err(|e| reference_context(reference, e))?;
    drop(file);

    let output = Command::new("mke2fs")
        .arg("-t")
        .arg("ext4")
        .arg("-d")
        .arg(rootfs_dir)
        .arg("-F")
        .arg(image_path)
        .output()
        .await
        .map_err(|e| reference_context(reference, format!("spawning mke2fs: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let _ = tokio::fs::remove_file(image_path).await;
        return Err(reference_context(reference, format!("mke2fs failed: {stderr}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolv_conf_fallback_is_written_under_etc() {
        let dir = tempfile::tempdir().unwrap();
        write_resolv_conf("ref", dir.path()).await.unwrap();
        let content = tokio::fs::read_to_string(dir.path().join("etc/resolv.conf")).await.unwrap();
        assert!(content.contains("nameserver"));
    }

    #[tokio::test]
    async fn inject_init_copies_binary_with_executable_mode() {
        let dir = tempfile::tempdir().unwrap();
        let init_src = dir.path().join("init-src");
        tokio::fs::write(&init_src, b"#!/bin/sh\necho hi\n").await.unwrap();

        inject_init("ref", dir.path(), &init_src).await.unwrap();

        let dest = dir.path().join("init");
        let meta = tokio::fs::metadata(&dest).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        }
        assert!(meta.is_file());
    }
}
