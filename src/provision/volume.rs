//! Volume provisioner.
//!
//! Three shapes, decided by the spec and the store's active driver:
//!
//! - declared source path: bind-mount into the shared directory at a
//!   random alphabetic subpath
//! - no source, thin-pool: allocate a 10 GiB thin device with
//!   `dmsetup`, format it to the pool's backing filesystem
//! - no source, union-fs: create a host directory and bind-mount it
//!
//! Posts one `VolumeReady` on success, `InitFailed` with the volume
//! name otherwise.

use super::{rand_alpha, run_tool};
use crate::constants::{
    DEFAULT_VOLUME_BYTES, HOST_VOLUME_DIR, SECTOR_SIZE, THIN_CHUNK_SECTORS,
    VOLUME_MOUNT_SUFFIX_LEN,
};
use crate::error::{Error, Result};
use crate::events::{BusSender, VmEvent, VolumeInfo};
use crate::host::{ContainerStore, StorageDriver};
use crate::spec::UserVolume;
use nix::mount::{mount, MsFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// One-shot job for one volume slot.
pub(crate) async fn create_volume(
    store: Arc<dyn ContainerStore>,
    volume: UserVolume,
    share_dir: PathBuf,
    bus: BusSender,
) {
    match provision(&*store, &volume, &share_dir).await {
        Ok(info) => {
            info!(volume = %info.name, fstype = %info.fstype, "volume ready");
            bus.post(VmEvent::VolumeReady(info)).await;
        }
        Err(e) => {
            let reason = Error::VolumeProvision {
                volume: volume.name.clone(),
                reason: e.to_string(),
            }
            .to_string();
            bus.post(VmEvent::InitFailed { reason }).await;
        }
    }
}

async fn provision(
    store: &dyn ContainerStore,
    volume: &UserVolume,
    share_dir: &Path,
) -> Result<VolumeInfo> {
    if let Some(source) = volume.source.as_deref().filter(|s| !s.is_empty()) {
        let subpath = bind_into_share(Path::new(source), share_dir)?;
        return Ok(VolumeInfo {
            name: volume.name.clone(),
            filepath: subpath,
            fstype: "dir".to_string(),
            format: String::new(),
        });
    }

    let store_info = store.info().await?;
    match store_info.driver {
        StorageDriver::ThinPool => {
            let volname = thin_volume_name(store_info.device_prefix(), &volume.name);
            let sectors = DEFAULT_VOLUME_BYTES / SECTOR_SIZE;
            let table = format!(
                "0 {sectors} thin {} {THIN_CHUNK_SECTORS}",
                store_info.pool_name
            );
            run_tool("dmsetup", &["create", &volname, "--table", &table]).await?;

            let device = format!("/dev/mapper/{volname}");
            let fstype = store_info.fstype();
            let mkfs = if fstype == "ext4" {
                "mkfs.ext4"
            } else {
                "mkfs.xfs"
            };
            run_tool(mkfs, &[&device]).await?;

            Ok(VolumeInfo {
                name: volume.name.clone(),
                filepath: device,
                fstype: fstype.to_string(),
                format: "raw".to_string(),
            })
        }
        StorageDriver::UnionFs => {
            let host_dir = Path::new(HOST_VOLUME_DIR).join(&volume.name);
            std::fs::create_dir_all(&host_dir)?;
            let subpath = bind_into_share(&host_dir, share_dir)?;
            Ok(VolumeInfo {
                name: volume.name.clone(),
                filepath: subpath,
                fstype: "dir".to_string(),
                format: String::new(),
            })
        }
    }
}

/// Thin volume device name: `<prefix>-volume-<name>`.
fn thin_volume_name(prefix: &str, name: &str) -> String {
    format!("{prefix}-volume-{name}")
}

/// Bind-mounts `source` under the shared directory, returning the
/// share-relative subpath.
fn bind_into_share(source: &Path, share_dir: &Path) -> Result<String> {
    let subpath = rand_alpha(VOLUME_MOUNT_SUFFIX_LEN);
    let target = share_dir.join(&subpath);
    std::fs::create_dir_all(&target)?;
    mount(
        Some(source),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        Error::Io(std::io::Error::other(format!(
            "bind mount {} -> {} failed: {e}",
            source.display(),
            target.display()
        )))
    })?;
    Ok(subpath)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thin_volume_naming() {
        assert_eq!(thin_volume_name("vg0", "data"), "vg0-volume-data");
    }

    #[test]
    fn thin_table_arithmetic() {
        // 10 GiB in 512-byte sectors.
        assert_eq!(DEFAULT_VOLUME_BYTES / SECTOR_SIZE, 20_971_520);
    }
}
