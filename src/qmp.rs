//! QMP client.
//!
//! One task owns the hypervisor's QMP unix socket. It performs the
//! greeting/`qmp_capabilities` handshake, then consumes sequenced
//! device sessions from a bounded queue, each a fixed run of QMP
//! commands ending in exactly one completion event on the bus:
//!
//! | session      | commands                              | completion        |
//! |--------------|---------------------------------------|-------------------|
//! | `DiskAdd`    | `blockdev-add` + `device_add`         | `BlockInserted`   |
//! | `NetDevAdd`  | `getfd` + `netdev_add` + `device_add` | `NetDevInserted`  |
//! | `SerialPort` | `chardev-add` + `device_add`          | `SerialAdded`     |
//! | `Quit`       | `quit`                                | (none)            |
//!
//! Tap fds travel with `getfd` as SCM_RIGHTS ancillary data.
//! Asynchronous QMP events arriving between or during sessions are
//! forwarded as `Qmp(kind)` bus events; socket failures post
//! `Interrupted`; a failed device command posts `InitFailed`.

use crate::constants::{SOCKET_CONNECT_ATTEMPTS, SOCKET_CONNECT_DELAY};
use crate::error::{Error, Result};
use crate::events::{BusSender, QmpEventKind, SourceKind, VmEvent};
use crate::provision::retry;
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use serde_json::{json, Value};
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// =============================================================================
// Sessions
// =============================================================================

/// One sequenced device session submitted by the controller.
pub enum QmpSession {
    /// Insert a block device (rootfs image or data volume) as a SCSI disk.
    DiskAdd {
        /// Slot key echoed in the completion event: image path for
        /// images, volume name for volumes.
        name: String,
        /// Source classification.
        kind: SourceKind,
        /// Backing file or device node.
        file: String,
        /// Block format (`raw`).
        format: String,
        /// SCSI id allocated by the controller.
        scsi_id: u32,
    },
    /// Insert a virtio-net device backed by a host tap fd.
    NetDevAdd {
        /// Interface slot index.
        index: usize,
        /// Guest device id.
        device: String,
        /// Tap fd, passed over the socket with SCM_RIGHTS.
        fd: OwnedFd,
        /// PCI slot.
        pci_addr: u32,
    },
    /// Add a serial chardev bound to a unix socket.
    SerialPort {
        /// Serial slot index.
        index: usize,
        /// Socket path QEMU will listen on (telnet mode).
        socket_path: PathBuf,
        /// PCI slot.
        pci_addr: u32,
    },
    /// Ask QEMU to exit.
    Quit,
}

impl QmpSession {
    /// Short session name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            QmpSession::DiskAdd { .. } => "disk-add",
            QmpSession::NetDevAdd { .. } => "net-add",
            QmpSession::SerialPort { .. } => "serial-port",
            QmpSession::Quit => "quit",
        }
    }
}

/// Guest-visible SCSI disk name for an allocated id (`sda`, `sdb`, ...,
/// `sdaa`).
#[must_use]
pub fn scsi_device_name(id: u32) -> String {
    let mut id = id;
    let mut suffix = String::new();
    loop {
        suffix.insert(0, (b'a' + (id % 26) as u8) as char);
        if id < 26 {
            break;
        }
        id = id / 26 - 1;
    }
    format!("sd{suffix}")
}

// =============================================================================
// Connection
// =============================================================================

/// Line-buffered QMP connection.
struct QmpConn {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl QmpConn {
    /// Reads one newline-terminated message. Cancel-safe: partially
    /// read data stays in the buffer.
    async fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&line).trim().to_string());
            }
            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "qmp socket closed",
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Writes one command line.
    async fn send(&mut self, cmd: &Value) -> io::Result<()> {
        let mut line = cmd.to_string();
        line.push('\n');
        self.stream.write_all(line.as_bytes()).await
    }

    /// Writes one command line with an fd as SCM_RIGHTS ancillary data.
    async fn send_with_fd(&self, cmd: &Value, fd: RawFd) -> io::Result<()> {
        let mut line = cmd.to_string();
        line.push('\n');
        let payload = line.into_bytes();
        self.stream
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(&payload)];
                let fds = [fd];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &iov,
                    &cmsgs,
                    MsgFlags::empty(),
                    None,
                )
                .map(|_| ())
                .map_err(|e| {
                    if e == nix::errno::Errno::EAGAIN {
                        io::Error::from(io::ErrorKind::WouldBlock)
                    } else {
                        io::Error::from(e)
                    }
                })
            })
            .await
    }
}

/// Sends one command and waits for its `return`/`error`, forwarding any
/// interleaved asynchronous events.
async fn execute(
    conn: &mut QmpConn,
    bus: &BusSender,
    cmd: Value,
    fd: Option<RawFd>,
) -> Result<Value> {
    debug!(cmd = %cmd["execute"], "qmp command");
    match fd {
        Some(fd) => conn.send_with_fd(&cmd, fd).await?,
        None => conn.send(&cmd).await?,
    }
    loop {
        let line = conn.read_line().await?;
        if line.is_empty() {
            continue;
        }
        let msg: Value = serde_json::from_str(&line)?;
        if let Some(event) = msg.get("event").and_then(Value::as_str) {
            forward_event(bus, event).await;
            continue;
        }
        if let Some(ret) = msg.get("return") {
            return Ok(ret.clone());
        }
        if let Some(err) = msg.get("error") {
            let desc = err
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or("unknown qmp error");
            return Err(Error::Qmp(format!("{}: {desc}", cmd["execute"])));
        }
        // Greeting or unknown message shape.
        debug!(%line, "unexpected qmp message ignored");
    }
}

/// Maps a QMP event name onto the bus.
async fn forward_event(bus: &BusSender, event: &str) {
    let kind = match event {
        "SHUTDOWN" => QmpEventKind::Shutdown,
        "RESET" => QmpEventKind::Reset,
        "POWERDOWN" => QmpEventKind::Powerdown,
        other => QmpEventKind::Other(other.to_string()),
    };
    debug!(event, "qmp event");
    bus.post(VmEvent::Qmp(kind)).await;
}

/// Reads the greeting and negotiates capabilities.
async fn handshake(conn: &mut QmpConn, bus: &BusSender) -> Result<()> {
    loop {
        let line = conn.read_line().await?;
        if line.is_empty() {
            continue;
        }
        let msg: Value = serde_json::from_str(&line)?;
        if msg.get("QMP").is_some() {
            break;
        }
        debug!(%line, "pre-greeting qmp message ignored");
    }
    execute(conn, bus, json!({"execute": "qmp_capabilities"}), None).await?;
    Ok(())
}

// =============================================================================
// Client Task
// =============================================================================

/// Runs the QMP client until the session queue closes, the `Quit`
/// session completes, or the socket fails.
pub async fn run_qmp(
    socket_path: PathBuf,
    mut sessions: mpsc::Receiver<QmpSession>,
    bus: BusSender,
) {
    // QEMU creates the socket shortly after starting.
    let stream = retry(
        SOCKET_CONNECT_ATTEMPTS,
        SOCKET_CONNECT_DELAY,
        "qmp socket connect",
        || {
            let path = socket_path.clone();
            async move { UnixStream::connect(&path).await }
        },
    )
    .await;

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            bus.post(VmEvent::Interrupted {
                reason: format!("qmp connect failed: {e}"),
            })
            .await;
            return;
        }
    };
    let mut conn = QmpConn {
        stream,
        buf: Vec::new(),
    };

    if let Err(e) = handshake(&mut conn, &bus).await {
        bus.post(VmEvent::Interrupted {
            reason: format!("qmp handshake failed: {e}"),
        })
        .await;
        return;
    }
    info!(socket = %socket_path.display(), "qmp channel established");

    loop {
        // The read future is dropped when the select resolves, so the
        // session path below gets the connection back.
        let step = tokio::select! {
            session = sessions.recv() => Step::Session(session),
            line = conn.read_line() => Step::Line(line),
        };

        match step {
            Step::Session(None) => {
                debug!("qmp session queue closed");
                return;
            }
            Step::Session(Some(session)) => {
                let quitting = matches!(session, QmpSession::Quit);
                if let Err(e) = run_session(&mut conn, &bus, session).await {
                    if quitting {
                        // QEMU may drop the socket instead of replying.
                        debug!(error = %e, "quit session ended without reply");
                    } else {
                        warn!(error = %e, "qmp session failed");
                        bus.post(VmEvent::InitFailed {
                            reason: e.to_string(),
                        })
                        .await;
                    }
                }
                if quitting {
                    return;
                }
            }
            Step::Line(Ok(line)) => {
                if line.is_empty() {
                    continue;
                }
                if let Ok(msg) = serde_json::from_str::<Value>(&line) {
                    if let Some(event) = msg.get("event").and_then(Value::as_str) {
                        forward_event(&bus, event).await;
                    }
                }
            }
            Step::Line(Err(e)) => {
                bus.post(VmEvent::Interrupted {
                    reason: format!("qmp socket failed: {e}"),
                })
                .await;
                return;
            }
        }
    }
}

/// Outcome of one turn of the client loop.
enum Step {
    Session(Option<QmpSession>),
    Line(io::Result<String>),
}

/// Executes one session's command sequence and posts its completion.
async fn run_session(conn: &mut QmpConn, bus: &BusSender, session: QmpSession) -> Result<()> {
    match session {
        QmpSession::DiskAdd {
            name,
            kind,
            file,
            format,
            scsi_id,
        } => {
            let node = format!("drive{scsi_id}");
            let file_driver = if file.starts_with("/dev/") {
                "host_device"
            } else {
                "file"
            };
            execute(
                conn,
                bus,
                json!({
                    "execute": "blockdev-add",
                    "arguments": {
                        "node-name": node,
                        "driver": format,
                        "file": { "driver": file_driver, "filename": file },
                    },
                }),
                None,
            )
            .await?;
            execute(
                conn,
                bus,
                json!({
                    "execute": "device_add",
                    "arguments": {
                        "driver": "scsi-hd",
                        "id": format!("scsi-disk{scsi_id}"),
                        "drive": node,
                        "scsi-id": scsi_id,
                    },
                }),
                None,
            )
            .await?;
            bus.post(VmEvent::BlockInserted {
                name,
                kind,
                device: scsi_device_name(scsi_id),
            })
            .await;
        }
        QmpSession::NetDevAdd {
            index,
            device,
            fd,
            pci_addr,
        } => {
            let fdname = format!("fd{index}");
            let netdev = format!("eth{index}");
            execute(
                conn,
                bus,
                json!({ "execute": "getfd", "arguments": { "fdname": fdname } }),
                Some(fd.as_raw_fd()),
            )
            .await?;
            execute(
                conn,
                bus,
                json!({
                    "execute": "netdev_add",
                    "arguments": { "type": "tap", "id": netdev, "fd": fdname },
                }),
                None,
            )
            .await?;
            execute(
                conn,
                bus,
                json!({
                    "execute": "device_add",
                    "arguments": {
                        "driver": "virtio-net-pci",
                        "netdev": netdev,
                        "id": device,
                        "addr": format!("{pci_addr:#04x}"),
                    },
                }),
                None,
            )
            .await?;
            bus.post(VmEvent::NetDevInserted { index }).await;
        }
        QmpSession::SerialPort {
            index,
            socket_path,
            pci_addr,
        } => {
            let chardev = format!("serial{index}");
            execute(
                conn,
                bus,
                json!({
                    "execute": "chardev-add",
                    "arguments": {
                        "id": chardev,
                        "backend": {
                            "type": "socket",
                            "data": {
                                "addr": {
                                    "type": "unix",
                                    "data": { "path": socket_path.display().to_string() },
                                },
                                "server": true,
                                "wait": false,
                                "telnet": true,
                            },
                        },
                    },
                }),
                None,
            )
            .await?;
            execute(
                conn,
                bus,
                json!({
                    "execute": "device_add",
                    "arguments": {
                        "driver": "pci-serial",
                        "chardev": chardev,
                        "id": format!("pciserial{index}"),
                        "addr": format!("{pci_addr:#04x}"),
                    },
                }),
                None,
            )
            .await?;
            bus.post(VmEvent::SerialAdded { index }).await;
        }
        QmpSession::Quit => {
            execute(conn, bus, json!({"execute": "quit"}), None).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::QMP_SESSION_DEPTH;
    use crate::events::event_bus;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    #[test]
    fn scsi_names() {
        assert_eq!(scsi_device_name(0), "sda");
        assert_eq!(scsi_device_name(1), "sdb");
        assert_eq!(scsi_device_name(25), "sdz");
        assert_eq!(scsi_device_name(26), "sdaa");
        assert_eq!(scsi_device_name(27), "sdab");
    }

    /// Minimal fake QMP endpoint: greets, then answers every command
    /// with an empty `return`, interleaving one `SHUTDOWN` event after
    /// the first device command.
    async fn fake_qemu(listener: UnixListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut commands = 0usize;
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = serde_json::from_str(&line).unwrap();
            assert!(msg.get("execute").is_some(), "unexpected line: {line}");
            commands += 1;
            if commands == 3 {
                // Event interleaved with a command response.
                write_half
                    .write_all(b"{\"event\": \"SHUTDOWN\"}\n")
                    .await
                    .unwrap();
            }
            write_half.write_all(b"{\"return\": {}}\n").await.unwrap();
        }
    }

    #[tokio::test]
    async fn disk_add_session_posts_block_inserted() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        tokio::spawn(fake_qemu(listener));

        let (bus, mut rx) = event_bus();
        let (session_tx, session_rx) = mpsc::channel(QMP_SESSION_DEPTH);
        tokio::spawn(run_qmp(socket_path, session_rx, bus));

        session_tx
            .send(QmpSession::DiskAdd {
                name: "/dev/mapper/img".to_string(),
                kind: SourceKind::Image,
                file: "/dev/mapper/img".to_string(),
                format: "raw".to_string(),
                scsi_id: 0,
            })
            .await
            .unwrap();

        // Third command overall (capabilities, blockdev-add, device_add)
        // triggers the interleaved SHUTDOWN, which must not disturb the
        // session completion.
        let mut saw_block = false;
        let mut saw_shutdown = false;
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                VmEvent::BlockInserted { name, device, .. } => {
                    assert_eq!(name, "/dev/mapper/img");
                    assert_eq!(device, "sda");
                    saw_block = true;
                }
                VmEvent::Qmp(QmpEventKind::Shutdown) => saw_shutdown = true,
                other => panic!("unexpected event {}", other.kind()),
            }
        }
        assert!(saw_block && saw_shutdown);
    }
}
