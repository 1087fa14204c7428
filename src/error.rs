use thiserror::Error;

/// Wire-level stream error codes (RFC 7540 Section 7).
///
/// These are the codes a transaction puts on the wire when it aborts, and
/// the codes it receives in peer resets and GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Which half of the transaction an error applies to.
///
/// An INGRESS-tagged error may still permit egress; see
/// [`TxnError::affects_ingress`] / [`TxnError::affects_egress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
    Both,
}

/// Classification of transaction failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Invalid state transition, length mismatch, chunk ordering violation,
    /// or an illegal feature combination.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The underlying transport refused a write or reset mid-stream.
    #[error("transport error: {0}")]
    Transport(String),
    /// The idle timer expired.
    #[error("transaction timed out")]
    Timeout,
    /// The peer reset the stream or sent a GOAWAY covering it.
    #[error("peer abort: {0:?}")]
    PeerAbort(ErrorCode),
    /// A window operation over- or underflowed.
    #[error("flow control violation")]
    FlowControl,
    /// The deferred ingress queue exceeded its budget.
    #[error("ingress buffer full")]
    BufferFull,
    /// The codec does not implement the requested operation.
    #[error("operation not supported by codec")]
    Unsupported,
}

/// A transaction error: a kind plus the direction it applies to.
///
/// Protocol, flow-control, and buffer errors are fatal to the transaction.
/// `Unsupported` is returned to the caller without touching state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} [{direction:?}]")]
pub struct TxnError {
    pub kind: ErrorKind,
    pub direction: Direction,
}

impl TxnError {
    pub fn new(kind: ErrorKind, direction: Direction) -> Self {
        TxnError { kind, direction }
    }

    pub fn protocol(direction: Direction, reason: impl Into<String>) -> Self {
        TxnError::new(ErrorKind::Protocol(reason.into()), direction)
    }

    pub fn unsupported() -> Self {
        TxnError::new(ErrorKind::Unsupported, Direction::Both)
    }

    /// The wire code to send if this error triggers an abort.
    pub fn code(&self) -> ErrorCode {
        match &self.kind {
            ErrorKind::Protocol(_) => ErrorCode::ProtocolError,
            ErrorKind::Transport(_) => ErrorCode::InternalError,
            ErrorKind::Timeout => ErrorCode::Cancel,
            ErrorKind::PeerAbort(code) => *code,
            ErrorKind::FlowControl => ErrorCode::FlowControlError,
            ErrorKind::BufferFull => ErrorCode::EnhanceYourCalm,
            ErrorKind::Unsupported => ErrorCode::InternalError,
        }
    }

    pub fn affects_ingress(&self) -> bool {
        matches!(self.direction, Direction::Ingress | Direction::Both)
    }

    pub fn affects_egress(&self) -> bool {
        matches!(self.direction, Direction::Egress | Direction::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for v in 0..=0xd {
            if v == 0x4 {
                // SETTINGS_TIMEOUT is connection-level, not in the stream set.
                continue;
            }
            let code = ErrorCode::from_u32(v);
            assert_eq!(code as u32, v);
        }
        assert_eq!(ErrorCode::from_u32(0xffff), ErrorCode::InternalError);
    }

    #[test]
    fn direction_predicates() {
        let e = TxnError::protocol(Direction::Ingress, "body before headers");
        assert!(e.affects_ingress());
        assert!(!e.affects_egress());
        assert_eq!(e.code(), ErrorCode::ProtocolError);

        let e = TxnError::new(ErrorKind::Timeout, Direction::Both);
        assert!(e.affects_ingress());
        assert!(e.affects_egress());
    }
}
