//! Message transport boundary for task dispatch.

mod transport;

pub use transport::{
    AgentMailbox, ChannelTransport, DispatchAck, MessageTransport, TaskEnvelope,
};
