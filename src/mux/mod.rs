//! Terminal multiplexing.
//!
//! Two multiplexer variants share the subscriber abstraction in this
//! module:
//!
//! - [`TtyContext`] maps one hypervisor-side serial byte stream to a
//!   set of subscriber I/O pairs (one per attached client terminal).
//! - [`PseudoTtys`] (in [`pty`]) multiplexes the framed guest-agent TTY
//!   channel, where sessions are tagged with 64-bit ids.
//!
//! Both fan hypervisor output out to every subscriber and treat a
//! subscriber write failure as local: the dead subscriber is detached,
//! the stream continues.

pub mod pty;
pub mod telnet;

pub use pty::{PseudoTtys, TtyMessage};
pub use telnet::TelnetFilter;

use crate::constants::EXIT_CHAR;
use crate::error::{Error, Result};
use crate::events::{ClientSender, ResponseCode, VmResponse};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Boxed subscriber/hypervisor input stream.
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed subscriber/hypervisor output stream.
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

// =============================================================================
// Client Hooks
// =============================================================================

/// Back-reference capability handed to terminal contexts.
///
/// Terminal contexts never own the controller; when a tagged subscriber
/// is removed they deregister the client through this narrow interface.
pub trait ClientHooks: Send + Sync {
    /// A tagged client's terminal subscription ended.
    fn client_dereg(&self, tag: &str);
}

/// Default hooks for embedders without a client registry.
pub struct NullHooks;

impl ClientHooks for NullHooks {
    fn client_dereg(&self, tag: &str) {
        debug!(tag, "client deregistered");
    }
}

// =============================================================================
// Subscriber I/O
// =============================================================================

/// One attached client terminal: an optional input stream read toward
/// the hypervisor and an optional output sink receiving the fan-out.
///
/// Closing a `TtyIo` (via detach or stream teardown) closes both halves
/// exactly once and fires the completion callback exactly once.
pub struct TtyIo {
    /// Bytes typed by the client, forwarded to the hypervisor.
    pub stdin: Option<Reader>,
    /// Sink receiving the hypervisor byte stream.
    pub stdout: Option<Writer>,
    /// Client tag for deregistration on removal.
    pub client_tag: Option<String>,
    /// Completion callback, fired once when the subscription ends.
    pub callback: Option<ClientSender>,
}

impl TtyIo {
    /// An output-only subscriber (no input half, no tag, no callback).
    #[must_use]
    pub fn output_only(stdout: Writer) -> Self {
        Self {
            stdin: None,
            stdout: Some(stdout),
            client_tag: None,
            callback: None,
        }
    }
}

/// Map entry for an attached subscriber. The input half, if any, lives
/// in its own forwarding task and is closed by aborting that task.
struct Subscriber {
    stdout: Option<Writer>,
    client_tag: Option<String>,
    callback: Option<ClientSender>,
    input_task: Option<JoinHandle<()>>,
}

// =============================================================================
// Serial TTY Context
// =============================================================================

/// Multiplexer for one hypervisor-side serial byte stream.
///
/// A reader task copies every hypervisor byte to every subscriber
/// output; per-subscriber input tasks copy client bytes back to the
/// hypervisor. The [`EXIT_CHAR`] sentinel on input detaches the
/// subscriber without touching the underlying stream.
pub struct TtyContext {
    name: String,
    conn_out: Mutex<Writer>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    hooks: Arc<dyn ClientHooks>,
}

impl TtyContext {
    /// Creates the context and starts the hypervisor reader task.
    ///
    /// With `telnet` set, the reader strips IAC sequences before the
    /// fan-out.
    pub fn new(
        name: impl Into<String>,
        reader: Reader,
        writer: Writer,
        telnet: bool,
        hooks: Arc<dyn ClientHooks>,
    ) -> Arc<Self> {
        let reader: Reader = if telnet {
            Box::new(TelnetFilter::new(reader))
        } else {
            reader
        };

        let tc = Arc::new(Self {
            name: name.into(),
            conn_out: Mutex::new(writer),
            subscribers: Mutex::new(HashMap::new()),
            hooks,
        });

        let reader_ctx = Arc::clone(&tc);
        tokio::spawn(reader_ctx.pump(reader));

        tc
    }

    /// Socket name this context was opened for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches a subscriber under `id`.
    ///
    /// # Errors
    ///
    /// A duplicate id fails with [`Error::DuplicateAttach`], leaving the
    /// subscriber map unchanged; the rejected `io` is dropped.
    pub async fn attach(self: &Arc<Self>, id: u64, io: TtyIo) -> Result<()> {
        let TtyIo {
            stdin,
            stdout,
            client_tag,
            callback,
        } = io;

        {
            let mut subs = self.subscribers.lock().await;
            if subs.contains_key(&id) {
                warn!(tty = %self.name, id, "attach id already present");
                return Err(Error::DuplicateAttach(id));
            }
            subs.insert(
                id,
                Subscriber {
                    stdout,
                    client_tag,
                    callback,
                    input_task: None,
                },
            );
        }

        if let Some(stdin) = stdin {
            let me = Arc::clone(self);
            let task = tokio::spawn(me.forward_input(id, stdin));
            let mut subs = self.subscribers.lock().await;
            match subs.get_mut(&id) {
                Some(sub) => sub.input_task = Some(task),
                // Removed before we got here; stop forwarding.
                None => task.abort(),
            }
        }

        Ok(())
    }

    /// Detaches and closes the subscriber under `id`, if present.
    pub async fn detach(self: &Arc<Self>, id: u64) {
        self.close_subscriber(id).await;
    }

    /// Number of live subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Detaches every subscriber; used during teardown.
    pub async fn close_all(self: &Arc<Self>) {
        let ids: Vec<u64> = self.subscribers.lock().await.keys().copied().collect();
        for id in ids {
            self.close_subscriber(id).await;
        }
    }

    /// Hypervisor-to-subscribers fan-out loop.
    async fn pump(self: Arc<Self>, mut reader: Reader) {
        let mut buf = [0u8; 1];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            let mut dead = Vec::new();
            {
                let mut subs = self.subscribers.lock().await;
                for (id, sub) in subs.iter_mut() {
                    let Some(out) = sub.stdout.as_mut() else {
                        continue;
                    };
                    if out.write_all(&buf[..n]).await.is_err() || out.flush().await.is_err() {
                        dead.push(*id);
                    }
                }
            }
            for id in dead {
                debug!(tty = %self.name, id, "subscriber write failed, removing");
                self.close_subscriber(id).await;
            }
        }
        debug!(tty = %self.name, "hypervisor stream ended");
    }

    /// Subscriber-to-hypervisor input loop; ends on error, EOF, or the
    /// detach sentinel, then detaches its subscriber.
    async fn forward_input(self: Arc<Self>, id: u64, mut stdin: Reader) {
        let mut buf = [0u8; 1];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) if buf[0] == EXIT_CHAR => {
                    debug!(tty = %self.name, id, "detach sentinel received");
                    break;
                }
                Ok(n) => {
                    let mut out = self.conn_out.lock().await;
                    if out.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.close_subscriber(id).await;
    }

    /// Removes a subscriber and closes its halves exactly once.
    async fn close_subscriber(&self, id: u64) {
        let sub = self.subscribers.lock().await.remove(&id);
        let Some(mut sub) = sub else { return };

        if let Some(task) = sub.input_task.take() {
            task.abort();
        }
        if let Some(mut out) = sub.stdout.take() {
            out.shutdown().await.ok();
        }
        if let Some(tag) = sub.client_tag.take() {
            self.hooks.client_dereg(&tag);
        }
        if let Some(callback) = sub.callback.take() {
            callback
                .send(VmResponse {
                    vm_id: String::new(),
                    code: ResponseCode::ExecFinish,
                    cause: "Command finished".to_string(),
                    data: Some(serde_json::json!(id)),
                })
                .ok();
        }
    }
}

// =============================================================================
// Console Line Sink
// =============================================================================

/// Output-only sink turning the VM console byte stream into log lines.
///
/// CR and CRLF are treated as line ends; a bare LF after CR is
/// swallowed so CRLF yields a single line.
pub struct LineSink {
    name: String,
    line: Vec<u8>,
    saw_cr: bool,
}

impl LineSink {
    /// Creates a sink logging under the given console name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            line: Vec::new(),
            saw_cr: false,
        }
    }

    fn emit(&mut self) {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        info!(console = %self.name, "{}", line);
        self.line.clear();
    }

    fn feed(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                let skip = self.saw_cr;
                self.saw_cr = false;
                if !skip {
                    self.emit();
                }
            }
            b'\r' => {
                self.saw_cr = true;
                self.emit();
            }
            _ => {
                self.saw_cr = false;
                self.line.push(byte);
            }
        }
    }
}

impl AsyncWrite for LineSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        for &byte in buf {
            me.feed(byte);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        if !me.line.is_empty() {
            me.emit();
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn hooks() -> Arc<dyn ClientHooks> {
        Arc::new(NullHooks)
    }

    #[tokio::test]
    async fn attach_rejects_duplicate_id() {
        let (vm_side, _keep) = duplex(64);
        let (vm_read, vm_write) = tokio::io::split(vm_side);
        let tc = TtyContext::new(
            "serial0",
            Box::new(vm_read),
            Box::new(vm_write),
            false,
            hooks(),
        );

        let (a, _a_keep) = duplex(64);
        let (_, a_write) = tokio::io::split(a);
        tc.attach(7, TtyIo::output_only(Box::new(a_write)))
            .await
            .unwrap();

        let (b, _b_keep) = duplex(64);
        let (_, b_write) = tokio::io::split(b);
        let err = tc
            .attach(7, TtyIo::output_only(Box::new(b_write)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateAttach(7)));
        assert_eq!(tc.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn detach_closes_once() {
        let (vm_side, _keep) = duplex(64);
        let (vm_read, vm_write) = tokio::io::split(vm_side);
        let tc = TtyContext::new(
            "serial0",
            Box::new(vm_read),
            Box::new(vm_write),
            false,
            hooks(),
        );

        let (cb_tx, mut cb_rx) = tokio::sync::mpsc::unbounded_channel();
        let (a, _a_keep) = duplex(64);
        let (_, a_write) = tokio::io::split(a);
        tc.attach(
            1,
            TtyIo {
                stdin: None,
                stdout: Some(Box::new(a_write)),
                client_tag: None,
                callback: Some(cb_tx),
            },
        )
        .await
        .unwrap();

        tc.detach(1).await;
        tc.detach(1).await;

        let resp = cb_rx.recv().await.unwrap();
        assert_eq!(resp.code, ResponseCode::ExecFinish);
        // Exactly one callback.
        assert!(cb_rx.try_recv().is_err());
    }
}
