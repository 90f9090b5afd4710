//! # vmpod
//!
//! **Pod-per-VM supervisor**
//!
//! This crate supervises a lightweight virtual machine running a
//! user-declared *pod*, a set of containers sharing one VM. It
//! provisions rootfs images and data volumes from a container-image
//! store, hot-adds them over QMP, plumbs tap interfaces and serial
//! terminals, drives the in-VM guest agent over a framed unix-socket
//! channel, and serves the long-running pod: terminal multiplexing,
//! ad-hoc exec, attach/detach, and orderly shutdown.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                            vmpod                                  │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                     ┌───────────────────┐                         │
//! │   RunPod / Exec     │     event bus     │   readiness events      │
//! │   Attach / Shutdown │  (bounded mpsc)   │◀──────────────┐         │
//! │  ───────────────────▶                   │               │         │
//! │                     └─────────┬─────────┘       ┌───────┴───────┐ │
//! │                               ▼                 │ provisioners  │ │
//! │                     ┌───────────────────┐       │ image │ volume│ │
//! │                     │    controller     │       │ nic   │ serial│ │
//! │                     │   Init→Running→   │       └───────────────┘ │
//! │                     │ Terminating→Clean │                         │
//! │                     └──┬──────┬──────┬──┘                         │
//! │          device-add    │      │      │  START_POD / EXEC_CMD      │
//! │        ┌───────────────┘      │      └──────────────┐             │
//! │        ▼                      ▼                     ▼             │
//! │  ┌───────────┐        ┌──────────────┐      ┌──────────────┐      │
//! │  │ QMP client│        │   TTY mux    │      │ agent channel│      │
//! │  │ (sessions)│        │ serial + pty │      │ (framed)     │      │
//! │  └─────┬─────┘        └──────┬───────┘      └──────┬───────┘      │
//! ├────────┼─────────────────────┼─────────────────────┼──────────────┤
//! │        ▼                     ▼                     ▼              │
//! │   qmp.sock             serial*.sock           agent.sock          │
//! │              QEMU (qemu-system-x86_64) + guest agent              │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! The controller is an event-driven state machine with four states:
//!
//! ```text
//!   Init ──── CommandAck(START_POD) ────▶ Running
//!     │                                     │
//!     │          Shutdown / Interrupted     │
//!     └──────────────┬──────────────────────┘
//!                    ▼
//!              Terminating ── QemuTimeout → QMP quit
//!                    │
//!               QemuExited (from any state)
//!                    ▼
//!               CleaningUp ─▶ teardown, one terminal response
//! ```
//!
//! The pod starts **exactly once**, only when every declared device is
//! ready: readiness is tracked as set membership (the *progress set*),
//! never as an event sequence, so arrival order does not matter.
//!
//! # Key Properties
//!
//! - **Single consumer**: all slot state lives on the controller task;
//!   workers communicate only by posting bus events.
//! - **One terminal event per provisioner**: every spawned job posts
//!   exactly one readiness or failure event.
//! - **Bounded everything**: the bus (128), the pty outbound channel
//!   (256), and the QMP/agent queues are bounded; producers tolerate a
//!   closed bus.
//! - **Best-effort watchdog**: shutdown escalates to a QMP `quit` after
//!   3 seconds, at most once; the QEMU exit stays authoritative.
//!
//! # Example
//!
//! ```rust,ignore
//! use vmpod::{launch, Collaborators, UserPod, VmConfig, VmEvent};
//!
//! # async fn run(collaborators: Collaborators, qemu_args: Vec<String>) -> vmpod::Result<()> {
//! let config = VmConfig::generate().with_cpu(2).with_memory_mib(512);
//! let mut handle = launch(config, collaborators, qemu_args).await?;
//!
//! let spec = UserPod::from_yaml(std::fs::read("pod.yaml")?.as_slice())?;
//! handle.bus.post(VmEvent::RunPod { spec }).await;
//!
//! while let Some(response) = handle.responses.recv().await {
//!     println!("{}: {}", response.vm_id, response.cause);
//! }
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod agent;
pub mod constants;
pub mod controller;
pub mod devices;
mod error;
pub mod events;
pub mod host;
pub mod mux;
pub mod provision;
pub mod qmp;
pub mod spec;
pub mod vm;

// =============================================================================
// Public API
// =============================================================================

pub use agent::{AgentCommand, EXEC_CMD, SHUTDOWN, START_POD};
pub use controller::{launch, Collaborators, ControllerChannels, VmController, VmHandle};
pub use error::{Error, Result};
pub use events::{
    BusSender, ClientSender, ExecCommand, QmpEventKind, ResponseCode, SourceKind, VmEvent,
    VmResponse,
};
pub use host::{
    ContainerConfig, ContainerStore, ImageBackend, NetworkAllocator, NetworkSettings,
    StorageDriver, StoreInfo,
};
pub use mux::{ClientHooks, LineSink, NullHooks, PseudoTtys, TtyContext, TtyIo};
pub use qmp::QmpSession;
pub use spec::{UserContainer, UserFile, UserPod, UserVolume};
pub use vm::VmConfig;
