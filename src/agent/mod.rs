//! Guest-agent channel: frame codec and control-channel tasks.
//!
//! The in-VM init process is driven over a unix socket with
//! length-prefixed frames. [`protocol`] defines the codec shared with
//! the agent TTY channel; [`channel`] provides the control-channel
//! reader/writer pair spawned once the socket is accepted.

pub mod channel;
pub mod protocol;

pub use channel::{spawn_agent_channel, AgentCommand};
pub use protocol::{
    code_name, encode_frame, read_frame, Frame, EXEC_CMD, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD,
    SHUTDOWN, START_POD,
};
