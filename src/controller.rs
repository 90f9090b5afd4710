//! Pod lifecycle controller.
//!
//! The centerpiece of the supervisor: a single-task state machine that
//! owns all device slot state and is the sole consumer of the event
//! bus. Provisioners, the QMP client, the hypervisor waiter, and the
//! agent channel all run concurrently and communicate with it only by
//! posting events.
//!
//! ```text
//!             RunPod + readiness events        CommandAck(START_POD)
//!   ┌──────┐ ─────────────────────────────┐   ┌─────────────────────┐
//!   │ Init │                              ▼   ▼                     │
//!   └──────┘                            run_pod ──────────▶ ┌─────────┐
//!       │                                                   │ Running │
//!       │  Shutdown / Interrupted                           └─────────┘
//!       │       (common handler)                                 │
//!       ▼                                                        │
//! ┌─────────────┐   QemuTimeout → QMP quit                       │
//! │ Terminating │ ◀──────────────────────────────────────────────┘
//! └─────────────┘
//!       │ QemuExited (common handler, any state)
//!       ▼
//! ┌────────────┐  teardown, final response, loop ends
//! │ CleaningUp │
//! └────────────┘
//! ```
//!
//! The pod starts exactly once, only when the progress set drains; the
//! bus closes exactly once; exactly one terminal client response is
//! emitted per controller lifetime.

use crate::agent::{self, spawn_agent_channel, AgentCommand};
use crate::constants::{
    AGENT_OUTBOUND_DEPTH, QMP_SESSION_DEPTH, SHARE_DIR_TAG, SHUTDOWN_WATCHDOG,
};
use crate::devices::{DeviceMap, SlotState};
use crate::error::{Error, Result};
use crate::events::{
    event_bus, BusSender, ClientSender, QmpEventKind, ResponseCode, SourceKind, VmEvent,
    VmResponse,
};
use crate::host::{ContainerStore, ImageBackend, NetworkAllocator};
use crate::mux::{ClientHooks, PseudoTtys, TtyContext};
use crate::provision::{HostProvisioners, Provisioners};
use crate::qmp::{run_qmp, QmpSession};
use crate::spec::UserPod;
use crate::vm::{launch_qemu, wait_agent_tty, wait_console, wait_init_ready, VmConfig};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Interfaces configured per VM.
const CONFIGURED_NETWORKS: usize = 1;

/// First PCI slot handed out for hot-added devices.
const FIRST_PCI_ADDR: u32 = 4;

// =============================================================================
// States
// =============================================================================

/// Controller states; the loop ends when the state clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Accumulating device readiness, driving QMP insertions.
    Init,
    /// Pod started; serving exec/attach/detach.
    Running,
    /// `SHUTDOWN` sent, watchdog armed, waiting for the QEMU exit.
    Terminating,
    /// QEMU gone; releasing resources and emitting the final response.
    CleaningUp,
}

// =============================================================================
// Wiring
// =============================================================================

/// Channel ends handed to the controller at construction.
pub struct ControllerChannels {
    /// Producer handle for re-posting and for spawned channel tasks.
    pub bus_tx: BusSender,
    /// Client response sink.
    pub client: ClientSender,
    /// QMP session queue.
    pub qmp: mpsc::Sender<QmpSession>,
    /// Agent command queue (sender side).
    pub agent_tx: mpsc::Sender<AgentCommand>,
    /// Agent command queue (receiver side), consumed when the agent
    /// socket is accepted. `None` when the channel is driven externally
    /// (tests).
    pub agent_rx: Option<mpsc::Receiver<AgentCommand>>,
    /// Console terminal context, published once the console connects.
    pub console: watch::Receiver<Option<Arc<TtyContext>>>,
}

/// External collaborator set for a production launch.
pub struct Collaborators {
    /// Container-image store.
    pub store: Arc<dyn ContainerStore>,
    /// Image-store driver.
    pub backend: Arc<dyn ImageBackend>,
    /// Host network allocator.
    pub network: Arc<dyn NetworkAllocator>,
    /// Client registry hooks for terminal contexts.
    pub hooks: Arc<dyn ClientHooks>,
}

/// Handle returned by [`launch`]: post client commands on `bus`, read
/// responses from `responses`.
pub struct VmHandle {
    /// Event bus producer for `RunPod`, `Exec`, `Attach`, `Shutdown`.
    pub bus: BusSender,
    /// Client response stream; exactly one terminal response arrives
    /// per controller lifetime.
    pub responses: mpsc::UnboundedReceiver<VmResponse>,
}

// =============================================================================
// Controller
// =============================================================================

/// The per-pod lifecycle controller.
pub struct VmController {
    config: VmConfig,
    state: Option<State>,
    devices: Option<DeviceMap>,
    hostname: String,
    started: bool,
    quit_issued: bool,
    watchdog_armed: bool,
    bus_closed: bool,
    next_scsi: u32,
    next_pci: u32,
    bus_tx: BusSender,
    client: ClientSender,
    qmp: mpsc::Sender<QmpSession>,
    agent_tx: mpsc::Sender<AgentCommand>,
    agent_rx: Option<mpsc::Receiver<AgentCommand>>,
    console: watch::Receiver<Option<Arc<TtyContext>>>,
    provisioners: Arc<dyn Provisioners>,
    backend: Arc<dyn ImageBackend>,
    ptys: Arc<PseudoTtys>,
}

impl VmController {
    /// Builds a controller in the `Init` state.
    #[must_use]
    pub fn new(
        config: VmConfig,
        channels: ControllerChannels,
        provisioners: Arc<dyn Provisioners>,
        backend: Arc<dyn ImageBackend>,
        ptys: Arc<PseudoTtys>,
    ) -> Self {
        Self {
            config,
            state: Some(State::Init),
            devices: None,
            hostname: String::new(),
            started: false,
            quit_issued: false,
            watchdog_armed: false,
            bus_closed: false,
            next_scsi: 0,
            next_pci: FIRST_PCI_ADDR,
            bus_tx: channels.bus_tx,
            client: channels.client,
            qmp: channels.qmp,
            agent_tx: channels.agent_tx,
            agent_rx: channels.agent_rx,
            console: channels.console,
            provisioners,
            backend,
            ptys,
        }
    }

    /// Main loop: dequeue, dispatch, until the state clears or the bus
    /// drains after closing.
    pub async fn run(mut self, mut bus: mpsc::Receiver<VmEvent>) {
        info!(vm_id = %self.config.id, "controller loop started");
        while self.state.is_some() {
            let Some(event) = bus.recv().await else {
                warn!(vm_id = %self.config.id, "event bus drained after close");
                break;
            };
            debug!(vm_id = %self.config.id, event = event.kind(), "event");
            self.handle(event, &mut bus).await;
        }
        info!(vm_id = %self.config.id, "controller loop ended");
    }

    async fn handle(&mut self, event: VmEvent, bus: &mut mpsc::Receiver<VmEvent>) {
        if self.state == Some(State::CleaningUp) {
            return self.handle_cleaning_up(event, bus).await;
        }
        let Some(event) = self.handle_common(event, bus).await else {
            return;
        };
        match self.state {
            Some(State::Init) => self.handle_init(event).await,
            Some(State::Running) => self.handle_running(event).await,
            Some(State::Terminating) => self.handle_terminating(event).await,
            Some(State::CleaningUp) => self.handle_cleaning_up(event, bus).await,
            None => {}
        }
    }

    // =========================================================================
    // Common Handler
    // =========================================================================

    /// Runs before every per-state handler; returns the event back when
    /// it was not consumed.
    async fn handle_common(
        &mut self,
        event: VmEvent,
        bus: &mut mpsc::Receiver<VmEvent>,
    ) -> Option<VmEvent> {
        match event {
            VmEvent::QemuExited { .. } => {
                info!(vm_id = %self.config.id, "qemu has exit, go to cleaning up");
                self.close_bus(bus);
                self.state = Some(State::CleaningUp);
                // Fall through so CleaningUp finalizes on this event.
                Some(event)
            }
            VmEvent::Qmp(QmpEventKind::Shutdown) => {
                info!(vm_id = %self.config.id, "got qmp shutdown event, go to cleaning up");
                self.state = Some(State::CleaningUp);
                None
            }
            VmEvent::Shutdown => {
                self.begin_teardown().await;
                None
            }
            VmEvent::Interrupted { reason } => {
                warn!(vm_id = %self.config.id, %reason, "channel interrupted, shutting down");
                self.begin_teardown().await;
                None
            }
            other => Some(other),
        }
    }

    /// Sends `SHUTDOWN`, arms the watchdog once, enters `Terminating`.
    ///
    /// The watchdog is best-effort: it is never disarmed, fires at most
    /// once, and its event is discarded if the bus already closed.
    async fn begin_teardown(&mut self) {
        self.agent_tx
            .send(AgentCommand {
                code: agent::SHUTDOWN,
                payload: Vec::new(),
            })
            .await
            .ok();
        if !self.watchdog_armed {
            self.watchdog_armed = true;
            let bus = self.bus_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SHUTDOWN_WATCHDOG).await;
                bus.post(VmEvent::QemuTimeout).await;
            });
        }
        info!(vm_id = %self.config.id, "shutdown command sent, now get into terminating state");
        self.state = Some(State::Terminating);
    }

    fn close_bus(&mut self, bus: &mut mpsc::Receiver<VmEvent>) {
        if !self.bus_closed {
            self.bus_closed = true;
            bus.close();
            debug!(vm_id = %self.config.id, "event bus closed");
        }
    }

    // =========================================================================
    // Init
    // =========================================================================

    async fn handle_init(&mut self, event: VmEvent) {
        match event {
            VmEvent::InitConnected { conn } => match conn {
                Some(conn) => {
                    info!(vm_id = %self.config.id, "begin to wait agent commands");
                    match self.agent_rx.take() {
                        Some(agent_rx) => {
                            spawn_agent_channel(conn, agent_rx, self.bus_tx.clone());
                        }
                        None => debug!("agent channel externally managed"),
                    }
                }
                None => {
                    self.bus_tx
                        .post(VmEvent::InitFailed {
                            reason: "agent socket accept failed".to_string(),
                        })
                        .await;
                }
            },
            VmEvent::RunPod { spec } => {
                info!(vm_id = %self.config.id, pod = %spec.name, "got spec, prepare devices");
                self.prepare_devices(spec);
            }
            VmEvent::ContainerCreated(info) => {
                let Some(devices) = self.devices.as_mut() else {
                    warn!("container readiness before spec");
                    return;
                };
                let need_insert = devices.container_created(&info);
                if need_insert {
                    let scsi_id = self.alloc_scsi();
                    if let Some(devices) = self.devices.as_mut() {
                        devices.set_container_scsi(info.index, scsi_id);
                    }
                    self.qmp
                        .send(QmpSession::DiskAdd {
                            name: info.image.clone(),
                            kind: SourceKind::Image,
                            file: info.image.clone(),
                            format: "raw".to_string(),
                            scsi_id,
                        })
                        .await
                        .ok();
                } else {
                    self.try_run_pod().await;
                }
            }
            VmEvent::VolumeReady(info) => {
                let Some(devices) = self.devices.as_mut() else {
                    warn!("volume readiness before spec");
                    return;
                };
                let need_insert = devices.volume_ready(&info);
                if need_insert {
                    let scsi_id = self.alloc_scsi();
                    if let Some(devices) = self.devices.as_mut() {
                        devices.set_volume_scsi(&info.name, scsi_id);
                    }
                    self.qmp
                        .send(QmpSession::DiskAdd {
                            name: info.name.clone(),
                            kind: SourceKind::Volume,
                            file: info.filepath.clone(),
                            format: info.format.clone(),
                            scsi_id,
                        })
                        .await
                        .ok();
                } else {
                    self.try_run_pod().await;
                }
            }
            VmEvent::BlockInserted { name, kind, device } => {
                if let Some(devices) = self.devices.as_mut() {
                    devices.block_inserted(&name, kind, &device);
                }
                self.try_run_pod().await;
            }
            VmEvent::InterfaceCreated(mut info) => match info.fd.take() {
                Some(fd) if !info.ip.is_empty() => {
                    if let Some(devices) = self.devices.as_mut() {
                        devices.interface_created(&info);
                    }
                    self.qmp
                        .send(QmpSession::NetDevAdd {
                            index: info.index,
                            device: info.device.clone(),
                            fd,
                            pci_addr: info.pci_addr,
                        })
                        .await
                        .ok();
                }
                _ => {
                    self.respond(
                        ResponseCode::DeviceFail,
                        format!("network interface {} creation fail", info.index),
                    );
                }
            },
            VmEvent::NetDevInserted { index } => {
                if let Some(devices) = self.devices.as_mut() {
                    devices.netdev_inserted(index);
                }
                self.try_run_pod().await;
            }
            VmEvent::SerialAdded { index } => {
                if let Some(devices) = self.devices.as_mut() {
                    devices.serial_added(index);
                }
                self.try_run_pod().await;
            }
            VmEvent::TtyOpened { index, tty } => {
                if let Some(devices) = self.devices.as_mut() {
                    devices.tty_opened(index, tty);
                }
                self.try_run_pod().await;
            }
            VmEvent::CommandAck { code, payload } => {
                if code == agent::START_POD {
                    info!(vm_id = %self.config.id, ack = %String::from_utf8_lossy(&payload), "run success");
                    self.respond(ResponseCode::Ok, "Start POD success");
                    self.state = Some(State::Running);
                } else {
                    warn!(code = agent::code_name(code), "wrong reply during init");
                }
            }
            VmEvent::InitFailed { reason } => {
                warn!(vm_id = %self.config.id, %reason, "pod init failed");
                self.respond(ResponseCode::InitFail, reason);
            }
            other => warn!(event = other.kind(), "got event during pod initiating"),
        }
    }

    /// Seeds the inventory and fans the provisioners out.
    fn prepare_devices(&mut self, spec: UserPod) {
        if self.devices.is_some() {
            warn!(vm_id = %self.config.id, "duplicate RunPod ignored");
            return;
        }
        let devices = DeviceMap::from_spec(&spec, CONFIGURED_NETWORKS);
        debug!(
            vm_id = %self.config.id,
            outstanding = devices.progress_len(),
            "device inventory initialized"
        );
        self.hostname = spec.name.clone();
        self.devices = Some(devices);

        for (i, container) in spec.containers.iter().enumerate() {
            self.provisioners.spawn_container(
                i,
                container.clone(),
                spec.files.clone(),
                self.bus_tx.clone(),
            );
        }
        for volume in &spec.volumes {
            self.provisioners
                .spawn_volume(volume.clone(), self.bus_tx.clone());
        }
        for i in 0..CONFIGURED_NETWORKS {
            let pci_addr = self.alloc_pci();
            self.provisioners
                .spawn_interface(i, pci_addr, format!("eth{i}"), i == 0, self.bus_tx.clone());
        }
        for i in 0..spec.containers.len() {
            let pci_addr = self.alloc_pci();
            self.provisioners
                .spawn_serial(i, pci_addr, self.bus_tx.clone());
        }
    }

    /// Starts the pod when the progress set is empty. Latched: the
    /// second and later invocations are no-ops.
    async fn try_run_pod(&mut self) {
        let ready = self.devices.as_ref().is_some_and(DeviceMap::ready);
        if !ready || self.started {
            return;
        }
        self.started = true;
        debug!(vm_id = %self.config.id, "device ready, could run pod");

        let Some(devices) = self.devices.as_ref() else {
            return;
        };
        let vm_spec = devices.vm_spec(&self.hostname, SHARE_DIR_TAG);
        match serde_json::to_vec(&vm_spec) {
            Ok(payload) => {
                self.agent_tx
                    .send(AgentCommand {
                        code: agent::START_POD,
                        payload,
                    })
                    .await
                    .ok();
            }
            Err(e) => {
                self.respond(
                    ResponseCode::JsonParseFail,
                    format!("vm spec serialize failed: {e}"),
                );
            }
        }
    }

    // =========================================================================
    // Running
    // =========================================================================

    async fn handle_running(&mut self, event: VmEvent) {
        match event {
            VmEvent::Exec(cmd) => match serde_json::to_vec(&cmd) {
                Ok(payload) => {
                    self.agent_tx
                        .send(AgentCommand {
                            code: agent::EXEC_CMD,
                            payload,
                        })
                        .await
                        .ok();
                }
                Err(e) => {
                    warn!(error = %e, "exec payload serialize failed");
                    self.respond(
                        ResponseCode::JsonParseFail,
                        format!("command {:?} parse failed", cmd.cmd),
                    );
                }
            },
            VmEvent::CommandAck { code, payload } => {
                if code == agent::EXEC_CMD {
                    info!(ack = %String::from_utf8_lossy(&payload), "exec command confirmed");
                } else {
                    warn!(code = agent::code_name(code), "wrong reply while running");
                }
            }
            VmEvent::Attach { container, reply } => {
                let tty = self.lookup_tty(&container);
                if tty.is_some() {
                    debug!(container = %container, "allocating tty");
                } else {
                    warn!(container = %container, "attach for unknown container");
                }
                reply.send(tty).ok();
            }
            VmEvent::Detach {
                container,
                attach_id,
            } => {
                if let Some(tty) = self.lookup_tty(&container) {
                    debug!(container = %container, attach_id, "drop tty");
                    tty.detach(attach_id).await;
                }
            }
            other => warn!(event = other.kind(), "got event during pod running"),
        }
    }

    /// Console for an empty name, the container's serial tty otherwise.
    fn lookup_tty(&self, container: &str) -> Option<Arc<TtyContext>> {
        if container.is_empty() {
            return self.console.borrow().clone();
        }
        let devices = self.devices.as_ref()?;
        let index = devices.lookup(container)?;
        devices.container_tty(index)
    }

    // =========================================================================
    // Terminating
    // =========================================================================

    async fn handle_terminating(&mut self, event: VmEvent) {
        match event {
            VmEvent::CommandAck { code, payload } => {
                if code == agent::SHUTDOWN {
                    info!(ack = %String::from_utf8_lossy(&payload), "shutdown accepted by agent");
                } else {
                    warn!(code = agent::code_name(code), "wrong reply while terminating");
                }
            }
            VmEvent::QemuTimeout => {
                if !self.quit_issued {
                    self.quit_issued = true;
                    warn!(vm_id = %self.config.id, "qemu did not exit in time, try to stop it");
                    self.qmp.send(QmpSession::Quit).await.ok();
                }
            }
            other => warn!(event = other.kind(), "got event during pod terminating"),
        }
    }

    // =========================================================================
    // CleaningUp
    // =========================================================================

    async fn handle_cleaning_up(&mut self, event: VmEvent, bus: &mut mpsc::Receiver<VmEvent>) {
        match event {
            VmEvent::QemuExited { .. } => {
                info!(vm_id = %self.config.id, "qemu has exit [cleaning up]");
                self.close_bus(bus);
                self.teardown().await;
                self.state = None;
                self.respond(ResponseCode::Shutdown, "qemu shut down");
            }
            other => debug!(event = other.kind(), "got event during pod cleaning up"),
        }
    }

    /// Releases every resource exactly once: inserted devices get their
    /// symmetric teardown, terminal contexts and pty sessions close.
    async fn teardown(&mut self) {
        if let Some(devices) = self.devices.take() {
            for slot in devices.containers() {
                if slot.image_state == SlotState::Inserted && !slot.id.is_empty() {
                    if let Err(e) = self
                        .backend
                        .unmount_rootfs(&slot.id, &self.config.share_dir)
                        .await
                    {
                        warn!(container = %slot.id, error = %e, "rootfs unmount failed");
                    }
                }
                if let Some(tty) = slot.tty.as_ref() {
                    tty.close_all().await;
                }
            }
            for (name, slot) in devices.volumes() {
                if slot.state != SlotState::Inserted || slot.fstype != "dir" {
                    // Thin devices go back with the pool.
                    continue;
                }
                let target = self.config.share_dir.join(&slot.filepath);
                if let Err(e) = nix::mount::umount(&target) {
                    warn!(volume = %name, error = %e, "volume unmount failed");
                }
            }
        }

        let console = self.console.borrow().clone();
        if let Some(console) = console {
            console.close_all().await;
        }
        self.ptys.close_all().await;
    }

    // =========================================================================
    // Allocation & Responses
    // =========================================================================

    fn alloc_scsi(&mut self) -> u32 {
        let id = self.next_scsi;
        self.next_scsi += 1;
        id
    }

    fn alloc_pci(&mut self) -> u32 {
        let addr = self.next_pci;
        self.next_pci += 1;
        addr
    }

    fn respond(&self, code: ResponseCode, cause: impl Into<String>) {
        self.client
            .send(VmResponse {
                vm_id: self.config.id.clone(),
                code,
                cause: cause.into(),
                data: None,
            })
            .ok();
    }
}

// =============================================================================
// Production Launch
// =============================================================================

/// Wires the full supervisor for one VM: sockets, QMP client, QEMU
/// process, provisioners, and the controller loop.
///
/// QEMU arguments are supplied by the embedder (argument construction
/// is a collaborator concern). On context-init failure the single
/// `CONTEXT_INIT_FAIL` response is emitted before the error returns.
pub async fn launch(
    config: VmConfig,
    collaborators: Collaborators,
    qemu_args: Vec<String>,
) -> Result<VmHandle> {
    let vm_id = config.id.clone();
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    match launch_inner(config, collaborators, qemu_args, client_tx.clone()).await {
        Ok(bus) => Ok(VmHandle {
            bus,
            responses: client_rx,
        }),
        Err(e) => {
            client_tx
                .send(VmResponse {
                    vm_id,
                    code: ResponseCode::ContextInitFail,
                    cause: e.to_string(),
                    data: None,
                })
                .ok();
            Err(e)
        }
    }
}

async fn launch_inner(
    config: VmConfig,
    collaborators: Collaborators,
    qemu_args: Vec<String>,
    client: ClientSender,
) -> Result<BusSender> {
    let ctx_err = |what: &str, e: std::io::Error| Error::ContextInit(format!("{what}: {e}"));

    std::fs::create_dir_all(&config.run_dir).map_err(|e| ctx_err("create run dir", e))?;
    std::fs::create_dir_all(&config.share_dir).map_err(|e| ctx_err("create share dir", e))?;

    let agent_listener =
        UnixListener::bind(config.agent_socket()).map_err(|e| ctx_err("bind agent socket", e))?;
    let tty_listener =
        UnixListener::bind(config.tty_socket()).map_err(|e| ctx_err("bind tty socket", e))?;
    let console_listener = UnixListener::bind(config.console_socket())
        .map_err(|e| ctx_err("bind console socket", e))?;

    let (bus_tx, bus_rx) = event_bus();
    let (qmp_tx, qmp_rx) = mpsc::channel(QMP_SESSION_DEPTH);
    let (agent_cmd_tx, agent_cmd_rx) = mpsc::channel(AGENT_OUTBOUND_DEPTH);
    let (console_tx, console_rx) = watch::channel(None);

    let ptys = PseudoTtys::new(Arc::clone(&collaborators.hooks));
    let provisioners: Arc<dyn Provisioners> = Arc::new(HostProvisioners {
        store: Arc::clone(&collaborators.store),
        backend: Arc::clone(&collaborators.backend),
        network: Arc::clone(&collaborators.network),
        qmp: qmp_tx.clone(),
        hooks: Arc::clone(&collaborators.hooks),
        share_dir: config.share_dir.clone(),
        socket_dir: config.run_dir.clone(),
    });

    tokio::spawn(run_qmp(config.qmp_socket(), qmp_rx, bus_tx.clone()));
    tokio::spawn(wait_init_ready(agent_listener, bus_tx.clone()));
    tokio::spawn(wait_agent_tty(
        tty_listener,
        Arc::clone(&ptys),
        bus_tx.clone(),
    ));
    tokio::spawn(wait_console(
        console_listener,
        format!("{}-console", config.id),
        Arc::clone(&collaborators.hooks),
        console_tx,
    ));
    tokio::spawn(launch_qemu(qemu_args, bus_tx.clone()));

    let controller = VmController::new(
        config,
        ControllerChannels {
            bus_tx: bus_tx.clone(),
            client,
            qmp: qmp_tx,
            agent_tx: agent_cmd_tx,
            agent_rx: Some(agent_cmd_rx),
            console: console_rx,
        },
        provisioners,
        Arc::clone(&collaborators.backend),
        ptys,
    );
    tokio::spawn(controller.run(bus_rx));

    Ok(bus_tx)
}
