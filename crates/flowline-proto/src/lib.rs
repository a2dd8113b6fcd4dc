//! Wire protocol shared by flowline clients.
//!
//! - [`events`]: the typed event taxonomy exchanged with the execution service
//! - [`packet`]: the Engine.IO v4 / Socket.IO v4 text framing those events travel in

pub mod events;
pub mod packet;

pub use events::{
    ClientEvent, EventKind, FeedbackRequestPayload, FeedbackResponsePayload, FinalOutputPayload,
    NodeErrorPayload, RunCompletePayload, RunErrorPayload, RunStartPayload, RunWarningPayload,
    RunWorkflowPayload, ServerEvent, StreamOutputPayload, WorkflowErrorPayload,
    WorkflowReceivedPayload,
};
pub use packet::{EnginePacket, OpenHandshake, PacketError, SocketPacket, DEFAULT_NAMESPACE};
