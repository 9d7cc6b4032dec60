use std::io;

use thiserror::Error;

use crate::association::JoinStep;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("`{command}` timed out after {attempts} attempt(s)")]
    Timeout { command: String, attempts: u32 },
    #[error("`{command}` got no acceptable reply after {attempts} attempt(s)")]
    NoAcceptableReply { command: String, attempts: u32 },
    #[error("failed to write `{command}` to the modem")]
    Write {
        command: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("decoded message queue is locked by a pending read")]
    Locked,
}

#[derive(Debug, Error)]
#[error("association failed at {step:?}")]
pub struct AssociationError {
    pub step: JoinStep,
    #[source]
    pub source: CommandError,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("modem is not associated")]
    NotAssociated,
    #[error("previous HTTP connection did not drop in time")]
    LinkBusy,
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("cannot read connection id from {0:?}")]
    MalformedCid(String),
    #[error("server dropped the connection before the request was sent")]
    DroppedByServer,
    #[error("reply does not carry `200 OK`")]
    MissingHttpOk,
    #[error("server answered {0:?} instead of the expected ack")]
    UnexpectedAck(String),
    #[error("no attempt succeeded out of {0}")]
    RetriesExhausted(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("expected `subject;content`, found {0} field(s)")]
    FieldCount(usize),
    #[error("unrecognized subject `{0}`")]
    UnknownSubject(String),
    #[error("unrecognized content `{content}` for subject `{subject}`")]
    UnknownContent { subject: String, content: String },
    #[error("invalid parameter in `{0}`")]
    BadParameter(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("expected 4 `#`-separated fields, found {0}")]
    FieldCount(usize),
    #[error("new-message flag `{0}` is not numeric")]
    BadFlag(String),
    #[error("`{0}` is not an integer")]
    BadValue(String),
}
