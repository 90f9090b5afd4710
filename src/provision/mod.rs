//! Device provisioners.
//!
//! One-shot concurrent jobs that prepare devices for the VM: image
//! mount, volume create, NIC allocate, serial attach. Every spawned
//! provisioner posts exactly one terminal event on the bus: a
//! readiness event on success, `InitFailed` on fatal failure (the NIC
//! provisioner signals failure in-band with an empty address instead).
//! The controller never retries a failed provisioner.

pub mod image;
pub mod nic;
pub mod serial;
pub mod volume;

use crate::error::{Error, Result};
use crate::events::BusSender;
use crate::host::{ContainerStore, ImageBackend, NetworkAllocator};
use crate::mux::ClientHooks;
use crate::qmp::QmpSession;
use crate::spec::{UserContainer, UserFile, UserVolume};
use rand::Rng;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::debug;

// =============================================================================
// Helpers
// =============================================================================

/// Runs a fallible operation up to `attempts` times with a fixed delay.
///
/// Serial-socket and QMP-socket connects are the only users; nothing
/// else in the supervisor retries.
pub(crate) async fn retry<T, E, F, Fut>(
    attempts: usize,
    delay: Duration,
    what: &str,
    mut op: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    for attempt in 1..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(what, attempt, error = %e, "attempt failed, retrying");
                sleep(delay).await;
            }
        }
    }
    op().await
}

/// Runs a host tool to completion, failing on a non-zero exit.
pub(crate) async fn run_tool(program: &str, args: &[&str]) -> Result<()> {
    debug!(program, ?args, "running host tool");
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        return Err(Error::Io(std::io::Error::other(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }
    Ok(())
}

/// Random lowercase-alphabetic string for mount subpaths.
pub(crate) fn rand_alpha(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect()
}

// =============================================================================
// Provisioner Set
// =============================================================================

/// Spawning seam between the controller and the provisioner jobs.
///
/// Each method fires one one-shot job; the job's single terminal event
/// arrives on the bus. Tests substitute a no-op implementation and
/// inject readiness events directly.
pub trait Provisioners: Send + Sync {
    /// Mounts a container rootfs and gathers its config.
    fn spawn_container(
        &self,
        index: usize,
        container: UserContainer,
        files: Vec<UserFile>,
        bus: BusSender,
    );

    /// Creates or binds one data volume.
    fn spawn_volume(&self, volume: UserVolume, bus: BusSender);

    /// Allocates one tap interface.
    fn spawn_interface(
        &self,
        index: usize,
        pci_addr: u32,
        device: String,
        is_default: bool,
        bus: BusSender,
    );

    /// Adds one serial port and connects its socket.
    fn spawn_serial(&self, index: usize, pci_addr: u32, bus: BusSender);
}

/// Production provisioner set backed by the host collaborators.
pub struct HostProvisioners {
    /// Container store contract.
    pub store: Arc<dyn ContainerStore>,
    /// Image-store driver contract.
    pub backend: Arc<dyn ImageBackend>,
    /// Host network allocator contract.
    pub network: Arc<dyn NetworkAllocator>,
    /// QMP session queue, used by the serial provisioner.
    pub qmp: mpsc::Sender<QmpSession>,
    /// Hooks handed to freshly opened terminal contexts.
    pub hooks: Arc<dyn ClientHooks>,
    /// Per-VM shared directory.
    pub share_dir: PathBuf,
    /// Directory holding the per-VM serial sockets.
    pub socket_dir: PathBuf,
}

impl Provisioners for HostProvisioners {
    fn spawn_container(
        &self,
        index: usize,
        container: UserContainer,
        files: Vec<UserFile>,
        bus: BusSender,
    ) {
        let store = Arc::clone(&self.store);
        let backend = Arc::clone(&self.backend);
        let share_dir = self.share_dir.clone();
        tokio::spawn(image::create_container(
            store, backend, index, container, files, share_dir, bus,
        ));
    }

    fn spawn_volume(&self, volume: UserVolume, bus: BusSender) {
        let store = Arc::clone(&self.store);
        let share_dir = self.share_dir.clone();
        tokio::spawn(volume::create_volume(store, volume, share_dir, bus));
    }

    fn spawn_interface(
        &self,
        index: usize,
        pci_addr: u32,
        device: String,
        is_default: bool,
        bus: BusSender,
    ) {
        let network = Arc::clone(&self.network);
        tokio::spawn(nic::create_interface(
            network, index, pci_addr, device, is_default, bus,
        ));
    }

    fn spawn_serial(&self, index: usize, pci_addr: u32, bus: BusSender) {
        let qmp = self.qmp.clone();
        let hooks = Arc::clone(&self.hooks);
        let socket_dir = self.socket_dir.clone();
        tokio::spawn(serial::attach_serial_port(
            qmp, hooks, index, pci_addr, socket_dir, bus,
        ));
    }
}

/// Provisioner set that spawns nothing; used by tests that drive the
/// controller with hand-crafted readiness events.
pub struct NullProvisioners;

impl Provisioners for NullProvisioners {
    fn spawn_container(
        &self,
        _index: usize,
        _container: UserContainer,
        _files: Vec<UserFile>,
        _bus: BusSender,
    ) {
    }

    fn spawn_volume(&self, _volume: UserVolume, _bus: BusSender) {}

    fn spawn_interface(
        &self,
        _index: usize,
        _pci_addr: u32,
        _device: String,
        _is_default: bool,
        _bus: BusSender,
    ) {
    }

    fn spawn_serial(&self, _index: usize, _pci_addr: u32, _bus: BusSender) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_stops_after_bound() {
        let calls = AtomicUsize::new(0);
        let result: std::result::Result<(), String> =
            retry(5, Duration::from_millis(200), "test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result = retry(5, Duration::from_millis(200), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n >= 2 {
                    Ok(n)
                } else {
                    Err("not yet".to_string())
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn rand_alpha_is_alphabetic() {
        let s = rand_alpha(10);
        assert_eq!(s.len(), 10);
        assert!(s.chars().all(|c| c.is_ascii_lowercase()));
    }
}
