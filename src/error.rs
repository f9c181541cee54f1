use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::delivery::message::MessageHandle;

/// The kinds of failure visible to callers. The discriminants are the exception codes used on
///  the wire when an error is returned to a peer as an exchange reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ErrorKind {
    /// catch-all for unexpected conditions - the outcome of the operation is unknown
    Resource = 0x0016,
    IncorrectCall = 0x0002,
    SessionUnavailable = 0x000A,
    SessionDropped = 0x000B,
    /// the connection never existed, or its handshake failed
    ConnectionUnavailable = 0x000F,
    /// the connection (or conversation) existed and was closed
    ConnectionDropped = 0x0010,
    LimitExceeded = 0x0017,
    /// I/O or protocol failure mid-use, invalidating every conversation on the connection
    ConnectionLost = 0x0018,
    Rollback = 0x0019,
    MessageNotLocked = 0x001F,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Resource => "resource failure",
            ErrorKind::IncorrectCall => "incorrect call",
            ErrorKind::SessionUnavailable => "session unavailable",
            ErrorKind::SessionDropped => "session dropped",
            ErrorKind::ConnectionUnavailable => "connection unavailable",
            ErrorKind::ConnectionDropped => "connection dropped",
            ErrorKind::LimitExceeded => "limit exceeded",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::Rollback => "transaction rolled back",
            ErrorKind::MessageNotLocked => "message not locked",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {context}")]
pub struct MqError {
    pub kind: ErrorKind,
    pub context: String,
    /// For operations on a set of message handles: the handles for which the operation
    ///  succeeded before the failure
    pub succeeded: Vec<MessageHandle>,
}

pub type MqResult<T> = Result<T, MqError>;

impl MqError {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> MqError {
        MqError {
            kind,
            context: context.into(),
            succeeded: Vec::new(),
        }
    }

    pub fn with_succeeded(mut self, succeeded: Vec<MessageHandle>) -> MqError {
        self.succeeded = succeeded;
        self
    }

    pub fn incorrect_call(context: impl Into<String>) -> MqError {
        Self::new(ErrorKind::IncorrectCall, context)
    }

    pub fn not_locked(handle: MessageHandle) -> MqError {
        Self::new(ErrorKind::MessageNotLocked, format!("{:?} is not locked to this session", handle))
    }

    pub fn connection_lost(context: impl Into<String>) -> MqError {
        Self::new(ErrorKind::ConnectionLost, context)
    }

    pub fn connection_dropped(context: impl Into<String>) -> MqError {
        Self::new(ErrorKind::ConnectionDropped, context)
    }

    pub fn is_connection_failure(&self) -> bool {
        matches!(self.kind, ErrorKind::ConnectionLost | ErrorKind::ConnectionDropped | ErrorKind::ConnectionUnavailable)
    }

    /// payload of an exception reply: error code (u16), message length (u32), UTF-8 message
    pub fn ser(&self, buf: &mut BytesMut) {
        let code: u16 = self.kind.into();
        buf.put_u16(code);
        buf.put_u32(self.context.len() as u32);
        buf.put_slice(self.context.as_bytes());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MqError> {
        let code = buf.try_get_u16()?;
        let len = buf.try_get_u32()? as usize;
        if buf.remaining() < len {
            anyhow::bail!("exception message is truncated: {} of {} bytes", buf.remaining(), len);
        }
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);

        // codes from a newer peer map to the catch-all
        let kind = ErrorKind::try_from(code).unwrap_or(ErrorKind::Resource);
        Ok(MqError::new(kind, String::from_utf8_lossy(&raw).into_owned()))
    }
}

impl From<anyhow::Error> for MqError {
    fn from(value: anyhow::Error) -> Self {
        MqError::new(ErrorKind::Resource, value.to_string())
    }
}
