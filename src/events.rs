//! Event bus and client response types.
//!
//! Every asynchronous worker in the supervisor communicates with the
//! lifecycle controller by posting tagged events on a single bounded
//! mpsc bus. The controller is the sole consumer; producers must
//! tolerate a closed bus (the send becomes a silent no-op).

use crate::constants::EVENT_BUS_DEPTH;
use crate::mux::TtyContext;
use crate::spec::UserPod;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

// =============================================================================
// Client Responses
// =============================================================================

/// Outcome code carried by a client response record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    /// Operation succeeded.
    Ok,
    /// VM context could not be constructed.
    ContextInitFail,
    /// A provisioner failed fatally before pod start.
    InitFail,
    /// A single device failed; the pod cannot start.
    DeviceFail,
    /// A payload could not be serialized or parsed.
    JsonParseFail,
    /// An exec session finished.
    ExecFinish,
    /// The VM shut down.
    Shutdown,
}

/// Response record emitted to the submitting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmResponse {
    /// Identifier of the VM this response concerns.
    pub vm_id: String,
    /// Outcome code.
    pub code: ResponseCode,
    /// Human-readable cause.
    pub cause: String,
    /// Optional structured payload (e.g. an attach id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Channel on which client responses are delivered.
pub type ClientSender = mpsc::UnboundedSender<VmResponse>;

// =============================================================================
// Event Payloads
// =============================================================================

/// Where an inserted block device came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Container rootfs image.
    Image,
    /// Data volume.
    Volume,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Image => write!(f, "image"),
            SourceKind::Volume => write!(f, "volume"),
        }
    }
}

/// Readiness payload posted by the image-mount provisioner.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    /// Container slot index.
    pub index: usize,
    /// Container id assigned by the container store.
    pub id: String,
    /// Rootfs mount point inside the guest.
    pub rootfs: String,
    /// Device node for block-backed rootfs, or a share-dir-relative
    /// path when `fstype` is `dir`.
    pub image: String,
    /// Rootfs filesystem type (`ext4`, `xfs`, or `dir`).
    pub fstype: String,
    /// Working directory for the container command.
    pub workdir: String,
    /// Container command.
    pub cmd: Vec<String>,
    /// Container environment.
    pub envs: HashMap<String, String>,
}

/// Readiness payload posted by the volume provisioner.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    /// Volume name from the spec.
    pub name: String,
    /// Block device absolute path, or a share-dir-relative path for
    /// `dir` volumes.
    pub filepath: String,
    /// Filesystem type (`ext4`, `xfs`, or `dir`).
    pub fstype: String,
    /// Block format (`raw`), empty for `dir` volumes.
    pub format: String,
}

/// One guest route installed alongside an interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Destination CIDR.
    pub destination: String,
    /// Gateway address, empty for link-scoped routes.
    pub gateway: String,
    /// Whether the route goes via this interface.
    pub via_this: bool,
}

/// Readiness payload posted by the NIC provisioner.
///
/// An empty `ip` signals allocation failure; the controller surfaces it
/// as a device failure.
#[derive(Debug)]
pub struct InterfaceInfo {
    /// Interface slot index.
    pub index: usize,
    /// PCI slot assigned by the controller.
    pub pci_addr: u32,
    /// Guest-visible device name (e.g. `eth0`).
    pub device: String,
    /// Host tap device fd, passed to QEMU over the QMP socket.
    pub fd: Option<OwnedFd>,
    /// Interface address, empty on failure.
    pub ip: String,
    /// Netmask in dotted-quad form.
    pub mask: String,
    /// Routes to install in the guest.
    pub routes: Vec<RouteRule>,
}

/// Ad-hoc command executed inside a running container.
///
/// Serialized verbatim as the `EXEC_CMD` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecCommand {
    /// Command argv.
    pub cmd: Vec<String>,
    /// Target container id; empty targets the first container.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
}

/// Asynchronous event kinds reported by QEMU over QMP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QmpEventKind {
    /// Guest-initiated or forced shutdown; treated like a QEMU exit.
    Shutdown,
    /// Guest reset.
    Reset,
    /// Guest powerdown request.
    Powerdown,
    /// Any other event, carried by name.
    Other(String),
}

// =============================================================================
// Events
// =============================================================================

/// A tagged event delivered to the lifecycle controller.
pub enum VmEvent {
    /// The QEMU process exited; authoritative terminal signal.
    QemuExited { message: String },
    /// The shutdown watchdog fired.
    QemuTimeout,
    /// Asynchronous QMP event from the hypervisor.
    Qmp(QmpEventKind),
    /// The guest agent control socket was accepted (`None` on failure).
    InitConnected { conn: Option<UnixStream> },
    /// A provisioner or channel failed fatally before pod start.
    InitFailed { reason: String },
    /// An agent or QMP channel failed while the pod was live.
    Interrupted { reason: String },
    /// Client command: run this pod.
    RunPod { spec: UserPod },
    /// Client command: execute inside a running container.
    Exec(ExecCommand),
    /// Client command: shut the pod down.
    Shutdown,
    /// Client command: attach a terminal. Empty container name selects
    /// the VM console. The reply carries the terminal context to attach
    /// through, or `None` when the container is unknown.
    Attach {
        container: String,
        reply: oneshot::Sender<Option<Arc<TtyContext>>>,
    },
    /// Client command: detach a previously attached terminal.
    Detach { container: String, attach_id: u64 },
    /// Image-mount provisioner finished for one container.
    ContainerCreated(ContainerInfo),
    /// Volume provisioner finished for one volume.
    VolumeReady(VolumeInfo),
    /// QMP confirmed a block device insertion.
    BlockInserted {
        name: String,
        kind: SourceKind,
        device: String,
    },
    /// NIC provisioner finished for one interface.
    InterfaceCreated(InterfaceInfo),
    /// QMP confirmed a netdev insertion.
    NetDevInserted { index: usize },
    /// QMP confirmed a serial chardev/device insertion.
    SerialAdded { index: usize },
    /// The serial socket was connected and wrapped in a terminal context.
    TtyOpened { index: usize, tty: Arc<TtyContext> },
    /// The guest agent acknowledged a command.
    CommandAck { code: u32, payload: Vec<u8> },
}

impl VmEvent {
    /// Short event name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            VmEvent::QemuExited { .. } => "QemuExited",
            VmEvent::QemuTimeout => "QemuTimeout",
            VmEvent::Qmp(_) => "QmpEvent",
            VmEvent::InitConnected { .. } => "InitConnected",
            VmEvent::InitFailed { .. } => "InitFailed",
            VmEvent::Interrupted { .. } => "Interrupted",
            VmEvent::RunPod { .. } => "RunPod",
            VmEvent::Exec(_) => "Exec",
            VmEvent::Shutdown => "Shutdown",
            VmEvent::Attach { .. } => "Attach",
            VmEvent::Detach { .. } => "Detach",
            VmEvent::ContainerCreated(_) => "ContainerCreated",
            VmEvent::VolumeReady(_) => "VolumeReady",
            VmEvent::BlockInserted { .. } => "BlockInserted",
            VmEvent::InterfaceCreated(_) => "InterfaceCreated",
            VmEvent::NetDevInserted { .. } => "NetDevInserted",
            VmEvent::SerialAdded { .. } => "SerialAdded",
            VmEvent::TtyOpened { .. } => "TtyOpened",
            VmEvent::CommandAck { .. } => "CommandAck",
        }
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Creates the controller event bus.
///
/// Returns the producer handle and the receiver consumed by the
/// controller main loop.
#[must_use]
pub fn event_bus() -> (BusSender, mpsc::Receiver<VmEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_BUS_DEPTH);
    (BusSender(tx), rx)
}

/// Producer handle for the event bus.
///
/// Sends block while the bus is full; once the controller has closed
/// the bus, events are discarded.
#[derive(Clone)]
pub struct BusSender(mpsc::Sender<VmEvent>);

impl BusSender {
    /// Posts an event, discarding it if the bus has closed.
    pub async fn post(&self, event: VmEvent) {
        let kind = event.kind();
        if self.0.send(event).await.is_err() {
            trace!(event = kind, "bus closed, event discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_wire_names() {
        let json = serde_json::to_string(&ResponseCode::DeviceFail).unwrap();
        assert_eq!(json, "\"DEVICE_FAIL\"");
        let json = serde_json::to_string(&ResponseCode::Ok).unwrap();
        assert_eq!(json, "\"OK\"");
    }

    #[test]
    fn exec_command_payload_shape() {
        let cmd = ExecCommand {
            cmd: vec!["ls".to_string(), "-l".to_string()],
            container: String::new(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"cmd":["ls","-l"]}"#);

        let cmd = ExecCommand {
            cmd: vec!["id".to_string()],
            container: "c1".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""container":"c1""#));
    }

    #[tokio::test]
    async fn closed_bus_discards_events() {
        let (tx, rx) = event_bus();
        drop(rx);
        // Must not panic or error.
        tx.post(VmEvent::Shutdown).await;
    }
}
