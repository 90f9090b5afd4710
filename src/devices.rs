//! Device inventory and readiness bookkeeping.
//!
//! The controller owns four parallel slot collections, one per device
//! class, plus a *progress set* of slots that have not yet reached
//! their terminal insertion state. Correctness depends on accumulation
//! to completeness, never on event arrival order: the pod becomes
//! eligible to start exactly when the progress set drains.

use crate::events::{ContainerInfo, InterfaceInfo, RouteRule, SourceKind, VolumeInfo};
use crate::mux::TtyContext;
use crate::spec::UserPod;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Slot States
// =============================================================================

/// Insertion state of one device slot.
///
/// Block and net devices walk `Pending → Ready → Inserted`; serial
/// ports and ttys walk `Pending → Attached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Declared, provisioner still running.
    Pending,
    /// Provisioned host-side, hypervisor insertion outstanding.
    Ready,
    /// Visible to the guest.
    Inserted,
    /// Serial/tty channel is live.
    Attached,
}

/// Identifier of one entry in the progress set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotId {
    /// Container rootfs block/image readiness.
    ContainerImage(usize),
    /// Container serial terminal readiness.
    ContainerTty(usize),
    /// Serial chardev insertion.
    Serial(usize),
    /// Volume readiness.
    Volume(String),
    /// Network interface insertion.
    Interface(usize),
}

// =============================================================================
// Slots
// =============================================================================

/// Controller record for one declared container.
pub struct ContainerSlot {
    /// Container id assigned by the store, empty until created.
    pub id: String,
    /// Device node or share-dir-relative rootfs path.
    pub image: String,
    /// Rootfs filesystem type.
    pub fstype: String,
    /// Working directory.
    pub workdir: String,
    /// Container command.
    pub cmd: Vec<String>,
    /// Container environment.
    pub envs: HashMap<String, String>,
    /// Guest-side block device name once inserted.
    pub device: Option<String>,
    /// SCSI id allocated for the rootfs insertion.
    pub scsi_id: Option<u32>,
    /// Rootfs readiness.
    pub image_state: SlotState,
    /// Serial terminal readiness.
    pub tty_state: SlotState,
    /// Serial terminal context, set by `TtyOpened`.
    pub tty: Option<Arc<TtyContext>>,
}

/// Controller record for one declared volume.
pub struct VolumeSlot {
    /// Block device path or share-dir-relative directory.
    pub filepath: String,
    /// Filesystem type.
    pub fstype: String,
    /// Block format, empty for directory volumes.
    pub format: String,
    /// Guest-side device name once inserted.
    pub device: Option<String>,
    /// SCSI id allocated for the insertion.
    pub scsi_id: Option<u32>,
    /// Readiness.
    pub state: SlotState,
}

/// Controller record for one network interface.
pub struct InterfaceSlot {
    /// PCI slot assigned at provisioning time.
    pub pci_addr: u32,
    /// Guest device name.
    pub device: String,
    /// Interface address.
    pub ip: String,
    /// Netmask.
    pub mask: String,
    /// Guest routes.
    pub routes: Vec<RouteRule>,
    /// Readiness.
    pub state: SlotState,
}

/// Controller record for one serial port.
pub struct SerialSlot {
    /// Hypervisor-side socket path.
    pub socket_path: String,
    /// Chardev insertion state.
    pub state: SlotState,
}

// =============================================================================
// Aggregated VM Spec
// =============================================================================

/// The effective VM spec sent to the guest agent with `START_POD`.
#[derive(Debug, Clone, Serialize)]
pub struct VmSpec {
    /// Guest hostname.
    pub hostname: String,
    /// Shared directory tag.
    pub share_dir: String,
    /// Containers in start order.
    pub containers: Vec<VmContainer>,
    /// Network interfaces.
    pub interfaces: Vec<VmInterface>,
    /// Routes to install.
    pub routes: Vec<RouteRule>,
    /// Data volumes.
    pub volumes: Vec<VmVolume>,
}

/// Per-container section of the VM spec.
#[derive(Debug, Clone, Serialize)]
pub struct VmContainer {
    pub id: String,
    pub rootfs: String,
    /// Block device name, or share-dir-relative path for `dir` fstype;
    /// the agent branches on `fstype`.
    pub image: String,
    pub fstype: String,
    pub workdir: String,
    pub cmd: Vec<String>,
    pub envs: HashMap<String, String>,
}

/// Per-interface section of the VM spec.
#[derive(Debug, Clone, Serialize)]
pub struct VmInterface {
    pub device: String,
    pub ip_address: String,
    pub net_mask: String,
}

/// Per-volume section of the VM spec.
#[derive(Debug, Clone, Serialize)]
pub struct VmVolume {
    pub name: String,
    /// Guest device name, or share-dir-relative path for `dir` fstype.
    pub device: String,
    pub fstype: String,
    pub format: String,
}

// =============================================================================
// Device Map
// =============================================================================

/// The controller's device inventory for one pod.
pub struct DeviceMap {
    containers: Vec<ContainerSlot>,
    volumes: HashMap<String, VolumeSlot>,
    interfaces: Vec<InterfaceSlot>,
    serials: Vec<SerialSlot>,
    progress: HashSet<SlotId>,
}

impl DeviceMap {
    /// Seeds slots and the progress set from a parsed pod spec.
    ///
    /// Every container contributes an image, a tty, and a serial entry;
    /// every volume and every configured interface contributes one
    /// entry each.
    #[must_use]
    pub fn from_spec(spec: &UserPod, networks: usize) -> Self {
        let mut progress = HashSet::new();
        let mut containers = Vec::with_capacity(spec.containers.len());
        let mut serials = Vec::with_capacity(spec.containers.len());

        for (i, c) in spec.containers.iter().enumerate() {
            progress.insert(SlotId::ContainerImage(i));
            progress.insert(SlotId::ContainerTty(i));
            progress.insert(SlotId::Serial(i));
            containers.push(ContainerSlot {
                id: String::new(),
                image: c.image.clone(),
                fstype: String::new(),
                workdir: c.workdir.clone().unwrap_or_default(),
                cmd: c.command.clone(),
                envs: HashMap::new(),
                device: None,
                scsi_id: None,
                image_state: SlotState::Pending,
                tty_state: SlotState::Pending,
                tty: None,
            });
            serials.push(SerialSlot {
                socket_path: String::new(),
                state: SlotState::Pending,
            });
        }

        let mut volumes = HashMap::new();
        for v in &spec.volumes {
            progress.insert(SlotId::Volume(v.name.clone()));
            volumes.insert(
                v.name.clone(),
                VolumeSlot {
                    filepath: String::new(),
                    fstype: v.fstype.clone().unwrap_or_default(),
                    format: String::new(),
                    device: None,
                    scsi_id: None,
                    state: SlotState::Pending,
                },
            );
        }

        let mut interfaces = Vec::with_capacity(networks);
        for i in 0..networks {
            progress.insert(SlotId::Interface(i));
            interfaces.push(InterfaceSlot {
                pci_addr: 0,
                device: String::new(),
                ip: String::new(),
                mask: String::new(),
                routes: Vec::new(),
                state: SlotState::Pending,
            });
        }

        Self {
            containers,
            volumes,
            interfaces,
            serials,
            progress,
        }
    }

    /// True once every slot reached its terminal state.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.progress.is_empty()
    }

    /// Slots still outstanding.
    #[must_use]
    pub fn progress_len(&self) -> usize {
        self.progress.len()
    }

    /// Number of container slots.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    /// Records an image-mount completion.
    ///
    /// Returns whether a block insertion is still required: `dir`
    /// rootfs rides the shared directory and completes immediately;
    /// anything else waits for `BlockInserted`.
    pub fn container_created(&mut self, info: &ContainerInfo) -> bool {
        let Some(slot) = self.containers.get_mut(info.index) else {
            warn!(index = info.index, "container readiness for unknown slot");
            return false;
        };
        slot.id = info.id.clone();
        slot.image = info.image.clone();
        slot.fstype = info.fstype.clone();
        slot.workdir = info.workdir.clone();
        slot.cmd = info.cmd.clone();
        slot.envs = info.envs.clone();

        if info.fstype == "dir" {
            slot.image_state = SlotState::Inserted;
            self.progress.remove(&SlotId::ContainerImage(info.index));
            false
        } else {
            slot.image_state = SlotState::Ready;
            true
        }
    }

    /// Records the SCSI id used for a container rootfs insertion.
    pub fn set_container_scsi(&mut self, index: usize, scsi_id: u32) {
        if let Some(slot) = self.containers.get_mut(index) {
            slot.scsi_id = Some(scsi_id);
        }
    }

    /// Records a volume completion; returns whether a block insertion
    /// is still required.
    pub fn volume_ready(&mut self, info: &VolumeInfo) -> bool {
        let Some(slot) = self.volumes.get_mut(&info.name) else {
            warn!(volume = %info.name, "volume readiness for unknown slot");
            return false;
        };
        slot.filepath = info.filepath.clone();
        slot.fstype = info.fstype.clone();
        slot.format = info.format.clone();

        if info.fstype == "dir" {
            slot.state = SlotState::Inserted;
            self.progress.remove(&SlotId::Volume(info.name.clone()));
            false
        } else {
            slot.state = SlotState::Ready;
            true
        }
    }

    /// Records the SCSI id used for a volume insertion.
    pub fn set_volume_scsi(&mut self, name: &str, scsi_id: u32) {
        if let Some(slot) = self.volumes.get_mut(name) {
            slot.scsi_id = Some(scsi_id);
        }
    }

    /// Records a confirmed block insertion.
    ///
    /// Image insertions are keyed by the image path the disk-add
    /// session was submitted with; volume insertions by volume name.
    pub fn block_inserted(&mut self, name: &str, kind: SourceKind, device: &str) {
        match kind {
            SourceKind::Image => {
                let Some((index, slot)) = self
                    .containers
                    .iter_mut()
                    .enumerate()
                    .find(|(_, s)| s.image == name)
                else {
                    warn!(name, "block insertion for unknown image");
                    return;
                };
                slot.device = Some(device.to_string());
                slot.image_state = SlotState::Inserted;
                self.progress.remove(&SlotId::ContainerImage(index));
            }
            SourceKind::Volume => {
                let Some(slot) = self.volumes.get_mut(name) else {
                    warn!(name, "block insertion for unknown volume");
                    return;
                };
                slot.device = Some(device.to_string());
                slot.state = SlotState::Inserted;
                self.progress.remove(&SlotId::Volume(name.to_string()));
            }
        }
        debug!(name, device, "block device inserted");
    }

    /// Records a successful interface allocation (still awaiting the
    /// netdev insertion).
    pub fn interface_created(&mut self, info: &InterfaceInfo) {
        let Some(slot) = self.interfaces.get_mut(info.index) else {
            warn!(index = info.index, "interface readiness for unknown slot");
            return;
        };
        slot.pci_addr = info.pci_addr;
        slot.device = info.device.clone();
        slot.ip = info.ip.clone();
        slot.mask = info.mask.clone();
        slot.routes = info.routes.clone();
        slot.state = SlotState::Ready;
    }

    /// Records a confirmed netdev insertion.
    pub fn netdev_inserted(&mut self, index: usize) {
        if let Some(slot) = self.interfaces.get_mut(index) {
            slot.state = SlotState::Inserted;
            self.progress.remove(&SlotId::Interface(index));
        }
    }

    /// Records a confirmed serial chardev insertion.
    pub fn serial_added(&mut self, index: usize) {
        if let Some(slot) = self.serials.get_mut(index) {
            slot.state = SlotState::Attached;
            self.progress.remove(&SlotId::Serial(index));
        }
    }

    /// Records the opened terminal context for a container.
    pub fn tty_opened(&mut self, index: usize, tty: Arc<TtyContext>) {
        if let Some(slot) = self.serials.get_mut(index) {
            slot.socket_path = tty.name().to_string();
        }
        if let Some(slot) = self.containers.get_mut(index) {
            slot.tty = Some(tty);
            slot.tty_state = SlotState::Attached;
            self.progress.remove(&SlotId::ContainerTty(index));
        }
    }

    /// Looks a container slot up by store-assigned id.
    #[must_use]
    pub fn lookup(&self, container: &str) -> Option<usize> {
        self.containers.iter().position(|s| s.id == container)
    }

    /// Terminal context of a container slot.
    #[must_use]
    pub fn container_tty(&self, index: usize) -> Option<Arc<TtyContext>> {
        self.containers.get(index).and_then(|s| s.tty.clone())
    }

    /// Container slots (teardown iteration).
    #[must_use]
    pub fn containers(&self) -> &[ContainerSlot] {
        &self.containers
    }

    /// Volume slots (teardown iteration).
    pub fn volumes(&self) -> impl Iterator<Item = (&String, &VolumeSlot)> {
        self.volumes.iter()
    }

    /// Builds the effective VM spec from the accumulated slot data.
    #[must_use]
    pub fn vm_spec(&self, hostname: &str, share_dir: &str) -> VmSpec {
        let containers = self
            .containers
            .iter()
            .map(|s| VmContainer {
                id: s.id.clone(),
                rootfs: "/rootfs".to_string(),
                image: match (&s.device, s.fstype.as_str()) {
                    (Some(device), fstype) if fstype != "dir" => device.clone(),
                    _ => s.image.clone(),
                },
                fstype: s.fstype.clone(),
                workdir: s.workdir.clone(),
                cmd: s.cmd.clone(),
                envs: s.envs.clone(),
            })
            .collect();

        let mut routes = Vec::new();
        let interfaces = self
            .interfaces
            .iter()
            .map(|s| {
                routes.extend(s.routes.iter().cloned());
                VmInterface {
                    device: s.device.clone(),
                    ip_address: s.ip.clone(),
                    net_mask: s.mask.clone(),
                }
            })
            .collect();

        let volumes = self
            .volumes
            .iter()
            .map(|(name, s)| VmVolume {
                name: name.clone(),
                device: match (&s.device, s.fstype.as_str()) {
                    (Some(device), fstype) if fstype != "dir" => device.clone(),
                    _ => s.filepath.clone(),
                },
                fstype: s.fstype.clone(),
                format: s.format.clone(),
            })
            .collect();

        VmSpec {
            hostname: hostname.to_string(),
            share_dir: share_dir.to_string(),
            containers,
            interfaces,
            routes,
            volumes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{UserContainer, UserVolume};

    fn pod(containers: usize, volumes: usize) -> UserPod {
        UserPod {
            name: "test-pod".to_string(),
            containers: (0..containers)
                .map(|i| UserContainer {
                    image: format!("image-{i}:latest"),
                    workdir: None,
                    command: Vec::new(),
                    files: Vec::new(),
                })
                .collect(),
            volumes: (0..volumes)
                .map(|i| UserVolume {
                    name: format!("vol-{i}"),
                    source: None,
                    fstype: None,
                })
                .collect(),
            files: Vec::new(),
        }
    }

    fn container_info(index: usize, fstype: &str) -> ContainerInfo {
        ContainerInfo {
            index,
            id: format!("ctr-{index}"),
            rootfs: "/rootfs".to_string(),
            image: format!("/dev/mapper/img-{index}"),
            fstype: fstype.to_string(),
            workdir: "/".to_string(),
            cmd: vec!["sh".to_string()],
            envs: HashMap::new(),
        }
    }

    #[test]
    fn progress_seeded_from_spec() {
        let map = DeviceMap::from_spec(&pod(2, 1), 1);
        // 2 images + 2 ttys + 2 serials + 1 volume + 1 interface.
        assert_eq!(map.progress_len(), 8);
        assert!(!map.ready());
    }

    #[test]
    fn block_rootfs_requires_insertion() {
        let mut map = DeviceMap::from_spec(&pod(1, 0), 0);
        let info = container_info(0, "ext4");
        assert!(map.container_created(&info));
        // Image still outstanding until the block insertion lands.
        assert_eq!(map.progress_len(), 3);

        map.block_inserted(&info.image, SourceKind::Image, "sda");
        assert_eq!(map.progress_len(), 2);
        assert_eq!(map.containers()[0].device.as_deref(), Some("sda"));
    }

    #[test]
    fn dir_rootfs_completes_without_insertion() {
        let mut map = DeviceMap::from_spec(&pod(1, 0), 0);
        let mut info = container_info(0, "dir");
        info.image = "overlay/ctr-0".to_string();
        assert!(!map.container_created(&info));
        assert_eq!(map.progress_len(), 2);
    }

    #[test]
    fn progress_is_monotonically_non_increasing() {
        let mut map = DeviceMap::from_spec(&pod(1, 1), 1);
        let mut sizes = vec![map.progress_len()];

        let info = container_info(0, "ext4");
        map.container_created(&info);
        sizes.push(map.progress_len());
        map.volume_ready(&VolumeInfo {
            name: "vol-0".to_string(),
            filepath: "/dev/mapper/vm-volume-vol-0".to_string(),
            fstype: "ext4".to_string(),
            format: "raw".to_string(),
        });
        sizes.push(map.progress_len());
        map.block_inserted(&info.image, SourceKind::Image, "sda");
        sizes.push(map.progress_len());
        map.block_inserted("vol-0", SourceKind::Volume, "sdb");
        sizes.push(map.progress_len());
        map.interface_created(&InterfaceInfo {
            index: 0,
            pci_addr: 5,
            device: "eth0".to_string(),
            fd: None,
            ip: "10.0.0.2".to_string(),
            mask: "255.255.255.0".to_string(),
            routes: Vec::new(),
        });
        sizes.push(map.progress_len());
        map.netdev_inserted(0);
        sizes.push(map.progress_len());
        map.serial_added(0);
        sizes.push(map.progress_len());

        for pair in sizes.windows(2) {
            assert!(pair[1] <= pair[0], "progress grew: {sizes:?}");
        }
        // Only the tty remains.
        assert_eq!(map.progress_len(), 1);
    }

    #[test]
    fn readiness_is_order_independent() {
        let orderings: [&[&str]; 2] = [
            &["container", "block", "iface", "netdev", "serial"],
            &["serial", "iface", "container", "netdev", "block"],
        ];
        for order in orderings {
            let mut map = DeviceMap::from_spec(&pod(1, 0), 1);
            let info = container_info(0, "ext4");
            for step in order {
                match *step {
                    "container" => {
                        map.container_created(&info);
                    }
                    "block" => map.block_inserted(&info.image, SourceKind::Image, "sda"),
                    "iface" => map.interface_created(&InterfaceInfo {
                        index: 0,
                        pci_addr: 4,
                        device: "eth0".to_string(),
                        fd: None,
                        ip: "10.0.0.2".to_string(),
                        mask: "255.255.255.0".to_string(),
                        routes: Vec::new(),
                    }),
                    "netdev" => map.netdev_inserted(0),
                    "serial" => map.serial_added(0),
                    _ => unreachable!(),
                }
                assert!(!map.ready());
            }
        }
    }

    #[test]
    fn vm_spec_branches_on_fstype() {
        let mut map = DeviceMap::from_spec(&pod(1, 0), 0);
        let info = container_info(0, "ext4");
        map.container_created(&info);
        map.block_inserted(&info.image, SourceKind::Image, "sda");
        let spec = map.vm_spec("test-pod", "share-1");
        assert_eq!(spec.containers[0].image, "sda");
        assert_eq!(spec.containers[0].rootfs, "/rootfs");
    }
}
