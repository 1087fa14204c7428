//! Sans-IO HTTP transaction core.
//!
//! This crate provides the per-stream state machine and flow-control
//! engine that sits between a protocol codec (HTTP/1.x, HTTP/2, or
//! HTTP/3-over-QUIC) and an application handler. It has no runtime
//! dependency -- the session feeds ingress events in, drains egress via a
//! scheduler-driven flush, and supplies the clock.
//!
//! # Architecture
//!
//! ```text
//!    codec events            handler callbacks
//!         |                        ^
//!   +-----v------------------------+-----+
//!   |            Transaction             |  ingress/egress automata,
//!   |  windows | deferred queues | pacer |  windows, pause/resume,
//!   +-----+------------------------^-----+  lifecycle
//!         |                        |
//!    Transport (egress ops)   EgressQueue (scheduling)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use httptxn::{Transaction, TxnConfig, TxnCtx, TxnDirection, StreamId};
//!
//! let mut txn = Transaction::new(
//!     TxnDirection::Downstream,
//!     StreamId(1),
//!     TxnConfig::default(),
//!     &mut queue,
//! );
//!
//! // Codec delivered a request.
//! let mut ctx = TxnCtx::new(&mut transport, &mut queue, &mut handler, now);
//! txn.on_ingress_headers_complete(&mut ctx, request);
//! txn.on_ingress_eom(&mut ctx);
//!
//! // Handler produced a response (typically from inside its callbacks).
//! txn.send_headers(&mut ctx, &response)?;
//! txn.send_body(&mut ctx, body)?;
//! txn.send_eom(&mut ctx)?;
//!
//! // Scheduler grants a write turn; buffered body flushes.
//! txn.on_write_ready(&mut ctx, 65_536, 1.0);
//! ```

pub mod config;
pub mod deferred;
pub mod error;
pub mod handler;
pub mod message;
pub(crate) mod metrics;
pub mod priority;
pub mod rate;
pub mod state;
pub mod transaction;
pub mod transport;
pub mod window;

/// Opaque stream identifier assigned by the session. Parity of the
/// numeric form encodes which side initiated the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub use config::{ExAttributes, TxnConfig};
pub use error::{Direction, ErrorCode, ErrorKind, TxnError};
pub use handler::{Handler, TransportCallback};
pub use message::{HeaderField, Headers, HttpMessage, UpgradeProtocol};
pub use priority::{EgressQueue, Priority, QueueHandle, RoundRobinQueue};
pub use state::{EgressState, IngressState};
pub use transaction::{Transaction, TxnCtx, TxnDirection};
pub use transport::{CodecInfo, Transport};
pub use window::Window;
