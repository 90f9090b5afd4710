//! Guest-agent pseudo-terminal multiplexer.
//!
//! The agent TTY socket carries every container pty as framed,
//! session-tagged messages (see [`crate::agent::protocol`] for the
//! frame layout). `PseudoTtys` demultiplexes inbound frames to the
//! subscribers attached to each session and drains an outbound channel
//! of `(session, bytes)` messages back to the socket.
//!
//! A session whose last non-persistent subscriber detaches is closed,
//! and the agent is told to close the pty with a zero-payload frame.
//! A zero-payload frame *from* the agent closes the session host-side.

use super::{ClientHooks, Reader, TtyIo, Writer};
use crate::agent::protocol::{encode_frame, read_frame};
use crate::constants::{EXIT_CHAR, TTY_OUTBOUND_DEPTH};
use crate::events::{BusSender, ClientSender, ResponseCode, VmEvent, VmResponse};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One outbound message to the agent TTY socket.
#[derive(Debug, Clone)]
pub struct TtyMessage {
    /// Session id.
    pub session: u64,
    /// Payload; empty tells the agent to close the pty.
    pub message: Vec<u8>,
}

/// One subscriber attached to a session.
struct Attachment {
    tag: Option<String>,
    stdout: Option<Writer>,
    callback: Option<ClientSender>,
    input_task: Option<JoinHandle<()>>,
}

/// All subscribers of one session.
struct SessionAttachments {
    #[allow(dead_code)]
    container: usize,
    persistent: bool,
    attachments: Vec<Attachment>,
}

/// Multiplexer for the framed guest-agent TTY channel.
pub struct PseudoTtys {
    outbound_tx: mpsc::Sender<TtyMessage>,
    outbound_rx: StdMutex<Option<mpsc::Receiver<TtyMessage>>>,
    sessions: Mutex<HashMap<u64, SessionAttachments>>,
    hooks: Arc<dyn ClientHooks>,
}

impl PseudoTtys {
    /// Creates the multiplexer; I/O starts when [`start`](Self::start)
    /// receives the accepted socket.
    #[must_use]
    pub fn new(hooks: Arc<dyn ClientHooks>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(TTY_OUTBOUND_DEPTH);
        Arc::new(Self {
            outbound_tx,
            outbound_rx: StdMutex::new(Some(outbound_rx)),
            sessions: Mutex::new(HashMap::new()),
            hooks,
        })
    }

    /// Starts the reader and writer tasks over the agent TTY stream.
    pub fn start<R, W>(self: &Arc<Self>, reader: R, writer: W, bus: BusSender)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let outbound_rx = self.outbound_rx.lock().ok().and_then(|mut rx| rx.take());
        let Some(outbound_rx) = outbound_rx else {
            warn!("agent tty already started");
            return;
        };

        let writer_task = {
            let me = Arc::clone(self);
            let bus = bus.clone();
            tokio::spawn(me.drain_outbound(writer, outbound_rx, bus))
        };

        let me = Arc::clone(self);
        tokio::spawn(me.pump(reader, bus, writer_task));
    }

    /// Attaches a subscriber to a session, creating the session on
    /// first attach.
    pub async fn connect(
        self: &Arc<Self>,
        container: usize,
        session: u64,
        io: TtyIo,
        persistent: bool,
    ) {
        let TtyIo {
            stdin,
            stdout,
            client_tag,
            callback,
        } = io;

        {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .entry(session)
                .or_insert_with(|| SessionAttachments {
                    container,
                    persistent,
                    attachments: Vec::new(),
                });
            entry.attachments.push(Attachment {
                tag: client_tag.clone(),
                stdout,
                callback,
                input_task: None,
            });
        }

        if let Some(stdin) = stdin {
            let me = Arc::clone(self);
            let tag = client_tag.clone();
            let task = tokio::spawn(me.forward_input(session, tag, stdin));

            let mut sessions = self.sessions.lock().await;
            if let Some(entry) = sessions.get_mut(&session) {
                if let Some(att) = entry
                    .attachments
                    .iter_mut()
                    .find(|a| a.tag == client_tag && a.input_task.is_none())
                {
                    att.input_task = Some(task);
                    return;
                }
            }
            // Attachment vanished before the task was registered.
            task.abort();
        }
    }

    /// Detaches the subscriber(s) carrying `tag` from a session.
    ///
    /// Closing the last subscriber of a non-persistent session closes
    /// the session and tells the agent to close the pty.
    pub async fn detach(self: &Arc<Self>, session: u64, tag: Option<&str>) {
        let (removed, close) = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(&session) else {
                return;
            };
            let mut removed = Vec::new();
            let mut i = 0;
            while i < entry.attachments.len() {
                if entry.attachments[i].tag.as_deref() == tag {
                    removed.push(entry.attachments.remove(i));
                } else {
                    i += 1;
                }
            }
            let close = !entry.persistent && entry.attachments.is_empty();
            (removed, close)
        };

        for att in removed {
            self.close_attachment(att).await;
        }
        if close {
            self.close_session(session, true).await;
        }
    }

    /// Closes a session, detaching every subscriber.
    ///
    /// With `notify_agent`, a zero-payload frame tells the agent to
    /// close the pty.
    pub async fn close_session(self: &Arc<Self>, session: u64, notify_agent: bool) {
        let entry = self.sessions.lock().await.remove(&session);
        let Some(entry) = entry else { return };

        debug!(session, "closing pty session");
        for att in entry.attachments {
            self.close_attachment(att).await;
        }
        if notify_agent {
            self.outbound_tx
                .send(TtyMessage {
                    session,
                    message: Vec::new(),
                })
                .await
                .ok();
        }
    }

    /// Closes every session; used during teardown.
    pub async fn close_all(self: &Arc<Self>) {
        let ids: Vec<u64> = self.sessions.lock().await.keys().copied().collect();
        for session in ids {
            self.close_session(session, false).await;
        }
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Number of subscribers attached to one session.
    pub async fn attachment_count(&self, session: u64) -> usize {
        self.sessions
            .lock()
            .await
            .get(&session)
            .map_or(0, |s| s.attachments.len())
    }

    /// Closes one attachment exactly once.
    async fn close_attachment(&self, mut att: Attachment) {
        if let Some(task) = att.input_task.take() {
            task.abort();
        }
        if let Some(mut out) = att.stdout.take() {
            out.shutdown().await.ok();
        }
        if let Some(tag) = att.tag.take() {
            self.hooks.client_dereg(&tag);
        }
        if let Some(callback) = att.callback.take() {
            callback
                .send(VmResponse {
                    vm_id: String::new(),
                    code: ResponseCode::ExecFinish,
                    cause: "Command finished".to_string(),
                    data: None,
                })
                .ok();
        }
    }

    /// Subscriber-to-agent input loop.
    async fn forward_input(self: Arc<Self>, session: u64, tag: Option<String>, mut stdin: Reader) {
        let mut buf = [0u8; 1];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) if buf[0] == EXIT_CHAR => {
                    debug!(session, "detach sentinel received");
                    break;
                }
                Ok(n) => {
                    let msg = TtyMessage {
                        session,
                        message: buf[..n].to_vec(),
                    };
                    if self.outbound_tx.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.detach(session, tag.as_deref()).await;
    }

    /// Inbound frame loop: fan payloads out to session subscribers.
    async fn pump<R>(self: Arc<Self>, mut reader: R, bus: BusSender, writer_task: JoinHandle<()>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    bus.post(VmEvent::Interrupted {
                        reason: format!("tty socket failed: {e}"),
                    })
                    .await;
                    writer_task.abort();
                    return;
                }
            };

            let session = frame.tag;
            if self.sessions.lock().await.get(&session).is_none() {
                debug!(session, "frame for unknown session dropped");
                continue;
            }

            if frame.payload.is_empty() {
                debug!(session, "session closed by peer, close pty");
                self.close_session(session, false).await;
                continue;
            }

            let mut failed: Vec<Option<String>> = Vec::new();
            {
                let mut sessions = self.sessions.lock().await;
                if let Some(entry) = sessions.get_mut(&session) {
                    for att in entry.attachments.iter_mut() {
                        let Some(out) = att.stdout.as_mut() else {
                            continue;
                        };
                        if out.write_all(&frame.payload).await.is_err()
                            || out.flush().await.is_err()
                        {
                            failed.push(att.tag.clone());
                        }
                    }
                }
            }
            for tag in failed {
                debug!(session, "subscriber write failed, detaching");
                self.detach(session, tag.as_deref()).await;
            }
        }
    }

    /// Outbound drain loop: one frame per message.
    async fn drain_outbound<W>(
        self: Arc<Self>,
        mut writer: W,
        mut outbound_rx: mpsc::Receiver<TtyMessage>,
        bus: BusSender,
    ) where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        while let Some(msg) = outbound_rx.recv().await {
            // Close notifications always pass; data frames only for
            // sessions still known.
            if !msg.message.is_empty() && !self.sessions.lock().await.contains_key(&msg.session) {
                continue;
            }
            let frame = encode_frame(msg.session, &msg.message);
            if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
                bus.post(VmEvent::Interrupted {
                    reason: "tty socket write failed".to_string(),
                })
                .await;
                return;
            }
        }
        debug!("tty outbound channel closed");
    }
}
