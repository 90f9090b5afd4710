//! Guest-agent control channel.
//!
//! After the agent's control socket is accepted, the controller spawns
//! this channel: a writer draining queued commands (one frame per
//! message) and a reader decoding acknowledgement frames into
//! `CommandAck` bus events. Socket failures on either side post
//! `Interrupted` and end the channel.

use super::protocol::{code_name, encode_frame, read_frame};
use crate::events::{BusSender, VmEvent};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

/// One queued control message for the guest agent.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    /// Request code (`START_POD`, `EXEC_CMD`, `SHUTDOWN`).
    pub code: u32,
    /// Serialized request payload, possibly empty.
    pub payload: Vec<u8>,
}

/// Spawns the reader and writer tasks for the agent control stream.
pub fn spawn_agent_channel<S>(
    stream: S,
    outbound: mpsc::Receiver<AgentCommand>,
    bus: BusSender,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(read_acks(reader, bus.clone()));
    tokio::spawn(write_commands(writer, outbound, bus));
}

/// Decodes ack frames and posts them as `CommandAck` events.
async fn read_acks<R>(mut reader: tokio::io::ReadHalf<R>, bus: BusSender)
where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                let code = frame.tag as u32;
                debug!(code = code_name(code), "agent ack received");
                bus.post(VmEvent::CommandAck {
                    code,
                    payload: frame.payload,
                })
                .await;
            }
            Err(e) => {
                bus.post(VmEvent::Interrupted {
                    reason: format!("agent channel read failed: {e}"),
                })
                .await;
                return;
            }
        }
    }
}

/// Drains queued commands, one frame per message.
async fn write_commands<W>(
    mut writer: tokio::io::WriteHalf<W>,
    mut outbound: mpsc::Receiver<AgentCommand>,
    bus: BusSender,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    while let Some(cmd) = outbound.recv().await {
        debug!(code = code_name(cmd.code), len = cmd.payload.len(), "agent command sent");
        let frame = encode_frame(u64::from(cmd.code), &cmd.payload);
        if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
            bus.post(VmEvent::Interrupted {
                reason: "agent channel write failed".to_string(),
            })
            .await;
            return;
        }
    }
    debug!("agent command channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::protocol::{Frame, START_POD};
    use crate::events::event_bus;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn commands_become_frames_and_acks_become_events() {
        let (host_side, agent_side) = tokio::io::duplex(1024);
        let (bus, mut bus_rx) = event_bus();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        spawn_agent_channel(host_side, cmd_rx, bus);

        cmd_tx
            .send(AgentCommand {
                code: START_POD,
                payload: b"{\"containers\":[]}".to_vec(),
            })
            .await
            .unwrap();

        let (mut agent_read, mut agent_write) = tokio::io::split(agent_side);
        let frame = read_frame(&mut agent_read).await.unwrap();
        assert_eq!(
            frame,
            Frame {
                tag: u64::from(START_POD),
                payload: b"{\"containers\":[]}".to_vec(),
            }
        );

        // Echo an ack back.
        let ack = encode_frame(u64::from(START_POD), b"ok");
        agent_write.write_all(&ack).await.unwrap();

        match bus_rx.recv().await.unwrap() {
            VmEvent::CommandAck { code, payload } => {
                assert_eq!(code, START_POD);
                assert_eq!(payload, b"ok");
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }
}
