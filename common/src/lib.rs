pub mod arena;
pub mod association;
pub mod channel;
pub mod config;
pub mod deadline;
pub mod error;
pub mod failure;
pub mod frame;
pub mod http;
pub mod mailbox;
pub mod messages;
pub mod scheduler;
pub mod subjects;
pub mod transport;
pub mod uplink;

#[cfg(test)]
mod testing;

pub use arena::{ReceiveArena, ARENA_CAPACITY};
pub use association::{AssociationState, ConnectionId, JoinPlan, JoinStep, LinkStatus, ModemLink};
pub use channel::{CommandChannel, CommandSpec};
pub use config::{
    FailureThresholds, NetworkConfig, RuntimeConfig, SchedulerConfig, SerialConfig, ServerConfig,
    UplinkTiming,
};
pub use error::{
    AssociationError, CommandError, MailboxError, PayloadError, SessionError, TransportError,
};
pub use failure::{FailureTracker, Recovery};
pub use frame::Frame;
pub use http::{HttpSession, RemoteUpdate};
pub use mailbox::{Mailbox, MailboxMessage, Recipient};
pub use messages::{AcCommand, ControlRequest, MainRequest, UplinkRequest};
pub use scheduler::{MainAction, MainTask};
pub use subjects::*;
pub use transport::SerialTransport;
pub use uplink::Uplink;
