//! Serial-port provisioner.
//!
//! Issues a QMP serial-port session for a prospective socket path, then
//! connects to that socket with bounded retries (QEMU creates it
//! asynchronously). The accepted connection is wrapped in a Telnet-mode
//! terminal context and posted as `TtyOpened`; connect exhaustion posts
//! `InitFailed`.

use super::retry;
use crate::constants::{SOCKET_CONNECT_ATTEMPTS, SOCKET_CONNECT_DELAY};
use crate::events::{BusSender, VmEvent};
use crate::mux::{ClientHooks, TtyContext};
use crate::qmp::QmpSession;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::debug;

/// One-shot job for one serial slot.
pub(crate) async fn attach_serial_port(
    qmp: mpsc::Sender<QmpSession>,
    hooks: Arc<dyn ClientHooks>,
    index: usize,
    pci_addr: u32,
    socket_dir: PathBuf,
    bus: BusSender,
) {
    let socket_path = socket_dir.join(format!("serial{index}.sock"));
    // Stale socket from a previous run.
    std::fs::remove_file(&socket_path).ok();

    qmp.send(QmpSession::SerialPort {
        index,
        socket_path: socket_path.clone(),
        pci_addr,
    })
    .await
    .ok();

    let connect = retry(
        SOCKET_CONNECT_ATTEMPTS,
        SOCKET_CONNECT_DELAY,
        "serial socket connect",
        || {
            let path = socket_path.clone();
            async move { UnixStream::connect(&path).await }
        },
    )
    .await;

    match connect {
        Ok(conn) => {
            debug!(index, socket = %socket_path.display(), "serial socket connected");
            let (reader, writer) = conn.into_split();
            let tty = TtyContext::new(
                socket_path.display().to_string(),
                Box::new(reader),
                Box::new(writer),
                true,
                hooks,
            );
            bus.post(VmEvent::TtyOpened { index, tty }).await;
        }
        Err(e) => {
            bus.post(VmEvent::InitFailed {
                reason: format!("{} init failed: {e}", socket_path.display()),
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::QMP_SESSION_DEPTH;
    use crate::mux::NullHooks;

    #[tokio::test(start_paused = true)]
    async fn exhausted_connect_posts_init_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, mut rx) = crate::events::event_bus();
        let (qmp_tx, mut qmp_rx) = mpsc::channel(QMP_SESSION_DEPTH);

        attach_serial_port(
            qmp_tx,
            Arc::new(NullHooks),
            0,
            6,
            dir.path().to_path_buf(),
            bus,
        )
        .await;

        // The QMP session is issued before the connect attempts.
        match qmp_rx.recv().await.unwrap() {
            QmpSession::SerialPort { index, .. } => assert_eq!(index, 0),
            other => panic!("unexpected session {}", other.kind()),
        }

        match rx.recv().await.unwrap() {
            VmEvent::InitFailed { reason } => {
                assert!(reason.contains("serial0.sock"));
                assert!(reason.contains("init failed"));
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn connects_and_posts_tty_opened() {
        let dir = tempfile::tempdir().unwrap();
        let (bus, mut rx) = crate::events::event_bus();
        let (qmp_tx, mut qmp_rx) = mpsc::channel(QMP_SESSION_DEPTH);

        // Play QEMU: create the serial socket once the QMP session lands.
        tokio::spawn(async move {
            let Some(QmpSession::SerialPort { socket_path, .. }) = qmp_rx.recv().await else {
                return;
            };
            let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
            let _conn = listener.accept().await;
            std::future::pending::<()>().await;
        });

        attach_serial_port(
            qmp_tx,
            Arc::new(NullHooks),
            0,
            6,
            dir.path().to_path_buf(),
            bus,
        )
        .await;

        match rx.recv().await.unwrap() {
            VmEvent::TtyOpened { index, tty } => {
                assert_eq!(index, 0);
                assert!(tty.name().ends_with("serial0.sock"));
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }
}
