//! Hypervisor process and socket plumbing.
//!
//! Spawns `qemu-system-x86_64` with externally supplied arguments,
//! forwards its stderr to the log, and posts `QemuExited` when it is
//! reaped; that exit is the authoritative terminal signal for the
//! controller.
//! Also accepts the three guest-facing sockets: the agent control
//! socket (`InitConnected`), the agent TTY socket (starts the pty
//! multiplexer), and the VM console (wrapped in a Telnet-mode terminal
//! context with a line-logging subscriber).

use crate::constants::RUN_BASE_DIR;
use crate::events::{BusSender, VmEvent};
use crate::mux::{ClientHooks, LineSink, PseudoTtys, TtyContext, TtyIo};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Hypervisor binary; arguments come from the embedder.
const QEMU_BINARY: &str = "qemu-system-x86_64";

// =============================================================================
// Configuration
// =============================================================================

/// Per-VM configuration: identity, sizing, and socket layout.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// VM identifier; names the runtime directory.
    pub id: String,
    /// vCPU count.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory_mib: u32,
    /// Directory shared with the guest (9p/virtfs tag target).
    pub share_dir: PathBuf,
    /// Runtime directory holding the control sockets.
    pub run_dir: PathBuf,
}

impl VmConfig {
    /// Creates a config with the default directory layout under
    /// `/var/run/vmpod/<id>/`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let run_dir = PathBuf::from(RUN_BASE_DIR).join(&id);
        Self {
            cpu: 1,
            memory_mib: 128,
            share_dir: run_dir.join("share"),
            run_dir,
            id,
        }
    }

    /// Generates a config with a random VM id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(format!("vm-{}", uuid::Uuid::new_v4()))
    }

    /// Overrides the vCPU count.
    #[must_use]
    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    /// Overrides the memory size.
    #[must_use]
    pub fn with_memory_mib(mut self, memory_mib: u32) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    /// Overrides the runtime directory (and the share dir under it).
    #[must_use]
    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = run_dir.into();
        self.share_dir = self.run_dir.join("share");
        self
    }

    /// QMP socket path.
    #[must_use]
    pub fn qmp_socket(&self) -> PathBuf {
        self.run_dir.join("qmp.sock")
    }

    /// Agent control socket path.
    #[must_use]
    pub fn agent_socket(&self) -> PathBuf {
        self.run_dir.join("agent.sock")
    }

    /// Agent TTY socket path.
    #[must_use]
    pub fn tty_socket(&self) -> PathBuf {
        self.run_dir.join("tty.sock")
    }

    /// Console socket path.
    #[must_use]
    pub fn console_socket(&self) -> PathBuf {
        self.run_dir.join("console.sock")
    }
}

// =============================================================================
// Hypervisor Process
// =============================================================================

/// Spawns QEMU and waits for it; the exit always posts `QemuExited`.
pub async fn launch_qemu(args: Vec<String>, bus: BusSender) {
    info!(args = %args.join(" "), "launching {QEMU_BINARY}");

    let mut child = match Command::new(QEMU_BINARY)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            bus.post(VmEvent::QemuExited {
                message: format!("cannot start {QEMU_BINARY}: {e}"),
            })
            .await;
            return;
        }
    };

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(stream = "qemu-stderr", "{}", line);
            }
        });
    } else {
        warn!("cannot capture qemu stderr");
    }

    let message = match child.wait().await {
        Ok(status) => format!("qemu exit with {status}"),
        Err(e) => format!("qemu wait failed: {e}"),
    };
    info!("{message}");
    bus.post(VmEvent::QemuExited { message }).await;
}

// =============================================================================
// Socket Acceptors
// =============================================================================

/// Accepts the agent control socket and posts `InitConnected`.
pub async fn wait_init_ready(listener: UnixListener, bus: BusSender) {
    match listener.accept().await {
        Ok((conn, _)) => {
            info!("guest agent connected");
            bus.post(VmEvent::InitConnected { conn: Some(conn) }).await;
        }
        Err(e) => {
            bus.post(VmEvent::InitFailed {
                reason: format!("cannot accept agent socket: {e}"),
            })
            .await;
        }
    }
}

/// Accepts the agent TTY socket and starts the pty multiplexer on it.
pub async fn wait_agent_tty(listener: UnixListener, ptys: Arc<PseudoTtys>, bus: BusSender) {
    match listener.accept().await {
        Ok((conn, _)) => {
            debug!("agent tty channel connected");
            let (reader, writer) = conn.into_split();
            ptys.start(reader, writer, bus);
        }
        Err(e) => {
            bus.post(VmEvent::InitFailed {
                reason: format!("cannot accept tty socket: {e}"),
            })
            .await;
        }
    }
}

/// Accepts the console socket, wraps it in a Telnet-mode terminal
/// context with a line-logging subscriber, and publishes it for
/// `Attach` with an empty container name.
pub async fn wait_console(
    listener: UnixListener,
    name: String,
    hooks: Arc<dyn ClientHooks>,
    console_tx: watch::Sender<Option<Arc<TtyContext>>>,
) {
    match listener.accept().await {
        Ok((conn, _)) => {
            debug!("console connected");
            let (reader, writer) = conn.into_split();
            let tty = TtyContext::new(
                name.clone(),
                Box::new(reader),
                Box::new(writer),
                true,
                hooks,
            );
            if tty
                .attach(0, TtyIo::output_only(Box::new(LineSink::new(name))))
                .await
                .is_err()
            {
                warn!("console line sink attach failed");
            }
            console_tx.send(Some(tty)).ok();
        }
        Err(e) => {
            warn!(error = %e, "cannot accept console socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_layout() {
        let config = VmConfig::new("vm-1");
        assert_eq!(config.qmp_socket(), PathBuf::from("/var/run/vmpod/vm-1/qmp.sock"));
        assert_eq!(config.share_dir, PathBuf::from("/var/run/vmpod/vm-1/share"));
    }

    #[test]
    fn run_dir_override_moves_share() {
        let config = VmConfig::new("vm-2").with_run_dir("/tmp/vms/vm-2");
        assert_eq!(config.agent_socket(), PathBuf::from("/tmp/vms/vm-2/agent.sock"));
        assert_eq!(config.share_dir, PathBuf::from("/tmp/vms/vm-2/share"));
    }
}
