//! External collaborator contracts.
//!
//! The container store, image backend, and host network allocator are
//! libraries behind narrow interfaces: the supervisor specifies their
//! contracts and never their transports. Production embedders implement
//! these traits (typically HTTP over a unix socket for the store);
//! tests use in-memory fakes.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::Path;

// =============================================================================
// Container Store
// =============================================================================

/// Storage driver reported by the container store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    /// Device-mapper thin pool; rootfs and volumes are thin block devices.
    ThinPool,
    /// Union filesystem; rootfs is an overlay directory in the share dir.
    UnionFs,
}

/// Result of the container store `info` call.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    /// Active storage driver.
    pub driver: StorageDriver,
    /// Thin pool name (thin-pool driver only).
    pub pool_name: String,
    /// Backing filesystem as reported by the store, unnormalized.
    pub backing_fs: String,
}

impl StoreInfo {
    /// Normalizes the backing filesystem to a guest-mountable fstype.
    ///
    /// Matching is by substring: `ext` means `ext4`, `xfs` means `xfs`,
    /// anything else falls back to `dir`.
    #[must_use]
    pub fn fstype(&self) -> &'static str {
        if self.backing_fs.contains("ext") {
            "ext4"
        } else if self.backing_fs.contains("xfs") {
            "xfs"
        } else {
            "dir"
        }
    }

    /// Device-name prefix derived from the pool name.
    ///
    /// A pool named `vg0-pool` yields the prefix `vg0`.
    #[must_use]
    pub fn device_prefix(&self) -> &str {
        match self.pool_name.find("-pool") {
            Some(idx) => &self.pool_name[..idx],
            None => &self.pool_name,
        }
    }
}

/// Container config as reported by the store `inspect` call.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Working directory.
    pub workdir: String,
    /// Image command.
    pub cmd: Vec<String>,
}

/// Narrow contract over the container-image store.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Queries the active storage driver, pool, and backing filesystem.
    async fn info(&self) -> Result<StoreInfo>;

    /// Creates a container from an image reference, returning its id.
    async fn create(&self, image: &str) -> Result<String>;

    /// Returns the config of a created container.
    async fn inspect(&self, id: &str) -> Result<ContainerConfig>;
}

// =============================================================================
// Image Backend
// =============================================================================

/// Narrow contract over the image-store driver (thin-pool or overlay
/// operations).
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Mounts a container's rootfs under the shared directory.
    ///
    /// Returns the block device node for thin-pool storage, or a
    /// share-dir-relative path for union-fs storage.
    async fn mount_rootfs(&self, container_id: &str, shared_dir: &Path) -> Result<String>;

    /// Injects a file into a mounted rootfs with the given permissions.
    async fn attach_file(
        &self,
        container_id: &str,
        source_uri: &str,
        target: &Path,
        perm: u32,
    ) -> Result<()>;

    /// Reverses `mount_rootfs` during teardown.
    async fn unmount_rootfs(&self, container_id: &str, shared_dir: &Path) -> Result<()>;
}

// =============================================================================
// Network Allocator
// =============================================================================

/// A tap interface allocated by the host network layer.
#[derive(Debug)]
pub struct NetworkSettings {
    /// Host-side tap device name.
    pub device: String,
    /// Allocated interface address.
    pub ip_address: String,
    /// Prefix length of the subnet.
    pub prefix_len: u8,
    /// Subnet gateway address.
    pub gateway: String,
    /// Open tap device fd, handed to QEMU.
    pub tap: OwnedFd,
}

/// Narrow contract over the host network allocator.
#[async_trait]
pub trait NetworkAllocator: Send + Sync {
    /// Allocates a tap interface with an address.
    ///
    /// `requested` may carry a subnet hint; empty lets the allocator
    /// choose.
    async fn allocate(&self, requested: &str) -> Result<NetworkSettings>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backing_fs_normalization() {
        let mut info = StoreInfo {
            driver: StorageDriver::ThinPool,
            pool_name: "vmpod-pool".to_string(),
            backing_fs: "extfs".to_string(),
        };
        assert_eq!(info.fstype(), "ext4");
        info.backing_fs = "xfs".to_string();
        assert_eq!(info.fstype(), "xfs");
        info.backing_fs = "btrfs".to_string();
        assert_eq!(info.fstype(), "dir");
    }

    #[test]
    fn device_prefix_strips_pool_suffix() {
        let info = StoreInfo {
            driver: StorageDriver::ThinPool,
            pool_name: "vg0-pool".to_string(),
            backing_fs: "ext4".to_string(),
        };
        assert_eq!(info.device_prefix(), "vg0");
    }
}
