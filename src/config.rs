//! Per-transaction configuration.

use std::time::Duration;

use crate::priority::Priority;
use crate::window::MAX_WINDOW;
use crate::StreamId;

/// Attributes of an extended (control-stream-bound) transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExAttributes {
    /// The control stream this transaction is bound to.
    pub control_stream: StreamId,
    /// Unidirectional transactions carry data in only one direction; the
    /// other is marked terminal at creation.
    pub unidirectional: bool,
}

/// Configuration fixed at transaction construction.
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Enable per-stream flow control (send and receive windows).
    pub use_flow_control: bool,
    /// Initial receive window capacity.
    pub recv_initial_window: u32,
    /// Initial send window capacity.
    pub send_initial_window: u32,
    /// Budget for ingress events buffered while the handler is paused.
    /// With flow control off, exceeding it is fatal to the transaction.
    pub max_deferred_ingress: usize,
    /// Deferred egress size at which the handler is asked to pause.
    pub egress_buffer_limit: usize,
    /// Idle timeout; `None` leaves timing to the transport's default.
    pub idle_timeout: Option<Duration>,
    /// Initial scheduling priority.
    pub priority: Priority,
    /// Present iff this is a pushed transaction: the id of the request
    /// stream the push is associated with.
    pub assoc_stream_id: Option<StreamId>,
    /// Present iff this is an extended transaction.
    pub ex_attributes: Option<ExAttributes>,
}

impl Default for TxnConfig {
    fn default() -> Self {
        TxnConfig {
            use_flow_control: false,
            recv_initial_window: 65535,
            send_initial_window: 65535,
            max_deferred_ingress: 64 * 1024,
            egress_buffer_limit: 8 * 1024,
            idle_timeout: None,
            priority: Priority::default(),
            assoc_stream_id: None,
            ex_attributes: None,
        }
    }
}

impl TxnConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.recv_initial_window > MAX_WINDOW {
            return Err("recv_initial_window exceeds 2^31 - 1".into());
        }
        if self.send_initial_window > MAX_WINDOW {
            return Err("send_initial_window exceeds 2^31 - 1".into());
        }
        if self.egress_buffer_limit == 0 {
            return Err("egress_buffer_limit must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(TxnConfig::default().validate().is_ok());
    }

    #[test]
    fn oversized_window_rejected() {
        let cfg = TxnConfig {
            recv_initial_window: MAX_WINDOW + 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
