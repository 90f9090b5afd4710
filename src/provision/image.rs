//! Image-mount provisioner.
//!
//! Creates a container from its image, mounts the rootfs under the
//! shared directory (thin block device or overlay directory, per the
//! store's active driver), injects declared files, and posts one
//! `ContainerCreated` event carrying the aggregated slot data.

use crate::error::{Error, Result};
use crate::events::{BusSender, ContainerInfo, VmEvent};
use crate::host::{ContainerStore, ImageBackend, StorageDriver};
use crate::spec::{UserContainer, UserFile};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One-shot job for one container slot.
pub(crate) async fn create_container(
    store: Arc<dyn ContainerStore>,
    backend: Arc<dyn ImageBackend>,
    index: usize,
    container: UserContainer,
    files: Vec<UserFile>,
    share_dir: PathBuf,
    bus: BusSender,
) {
    match provision(&*store, &*backend, index, &container, &files, &share_dir).await {
        Ok(info) => {
            info!(index, id = %info.id, fstype = %info.fstype, "container rootfs ready");
            bus.post(VmEvent::ContainerCreated(info)).await;
        }
        Err(e) => {
            let reason = Error::ImageProvision {
                index,
                reason: e.to_string(),
            }
            .to_string();
            bus.post(VmEvent::InitFailed { reason }).await;
        }
    }
}

async fn provision(
    store: &dyn ContainerStore,
    backend: &dyn ImageBackend,
    index: usize,
    container: &UserContainer,
    files: &[UserFile],
    share_dir: &Path,
) -> Result<ContainerInfo> {
    let store_info = store.info().await?;

    let id = store.create(&container.image).await?;
    let config = store.inspect(&id).await?;
    debug!(index, id = %id, image = %container.image, "container created");

    let image = backend.mount_rootfs(&id, share_dir).await?;
    let fstype = match store_info.driver {
        StorageDriver::ThinPool => store_info.fstype().to_string(),
        StorageDriver::UnionFs => "dir".to_string(),
    };

    for file_ref in &container.files {
        let Some(source) = files.iter().find(|f| f.name == file_ref.filename) else {
            continue;
        };
        if source.uri.is_empty() {
            continue;
        }
        backend
            .attach_file(&id, &source.uri, Path::new(&file_ref.path), file_ref.perm)
            .await?;
    }

    // Spec overrides win over the image config.
    let workdir = match container.workdir.as_deref() {
        Some(w) if !w.is_empty() => w.to_string(),
        _ => config.workdir,
    };
    let cmd = if container.command.is_empty() {
        config.cmd
    } else {
        container.command.clone()
    };

    Ok(ContainerInfo {
        index,
        id,
        rootfs: "/rootfs".to_string(),
        image,
        fstype,
        workdir,
        cmd,
        envs: config.env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bus;
    use crate::host::{ContainerConfig, StoreInfo};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeStore {
        driver: StorageDriver,
    }

    #[async_trait]
    impl ContainerStore for FakeStore {
        async fn info(&self) -> Result<StoreInfo> {
            Ok(StoreInfo {
                driver: self.driver,
                pool_name: "vg0-pool".to_string(),
                backing_fs: "extfs".to_string(),
            })
        }

        async fn create(&self, image: &str) -> Result<String> {
            Ok(format!("id-{image}"))
        }

        async fn inspect(&self, _id: &str) -> Result<ContainerConfig> {
            Ok(ContainerConfig {
                env: HashMap::from([("PATH".to_string(), "/bin".to_string())]),
                workdir: "/app".to_string(),
                cmd: vec!["serve".to_string()],
            })
        }
    }

    struct FakeBackend;

    #[async_trait]
    impl ImageBackend for FakeBackend {
        async fn mount_rootfs(&self, container_id: &str, _shared_dir: &Path) -> Result<String> {
            Ok(format!("/dev/mapper/{container_id}"))
        }

        async fn attach_file(
            &self,
            _container_id: &str,
            _source_uri: &str,
            _target: &Path,
            _perm: u32,
        ) -> Result<()> {
            Ok(())
        }

        async fn unmount_rootfs(&self, _container_id: &str, _shared_dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn thin_pool_rootfs_posts_container_created() {
        let (bus, mut rx) = event_bus();
        create_container(
            Arc::new(FakeStore {
                driver: StorageDriver::ThinPool,
            }),
            Arc::new(FakeBackend),
            0,
            UserContainer {
                image: "nginx:1.25".to_string(),
                workdir: None,
                command: Vec::new(),
                files: Vec::new(),
            },
            Vec::new(),
            PathBuf::from("/tmp/share"),
            bus,
        )
        .await;

        match rx.recv().await.unwrap() {
            VmEvent::ContainerCreated(info) => {
                assert_eq!(info.id, "id-nginx:1.25");
                assert_eq!(info.fstype, "ext4");
                assert_eq!(info.image, "/dev/mapper/id-nginx:1.25");
                // Image config applies when the spec has no override.
                assert_eq!(info.workdir, "/app");
                assert_eq!(info.cmd, vec!["serve".to_string()]);
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn union_fs_rootfs_is_dir() {
        let (bus, mut rx) = event_bus();
        create_container(
            Arc::new(FakeStore {
                driver: StorageDriver::UnionFs,
            }),
            Arc::new(FakeBackend),
            1,
            UserContainer {
                image: "alpine:3.19".to_string(),
                workdir: Some("/work".to_string()),
                command: vec!["sh".to_string()],
                files: Vec::new(),
            },
            Vec::new(),
            PathBuf::from("/tmp/share"),
            bus,
        )
        .await;

        match rx.recv().await.unwrap() {
            VmEvent::ContainerCreated(info) => {
                assert_eq!(info.fstype, "dir");
                assert_eq!(info.workdir, "/work");
                assert_eq!(info.cmd, vec!["sh".to_string()]);
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }
}
