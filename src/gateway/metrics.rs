use std::time::Duration;

use super::ConnectionState;

/// Observation points of a [`super::GatewayConnection`].
///
/// Every method has a no-op default so sinks only implement what they track.
pub trait GatewayMetrics: Send + Sync {
    fn state_changed(&self, _state: ConnectionState) {}
    fn reconnect_scheduled(&self, _attempt: u32, _delay: Duration) {}
    fn reconnect_exhausted(&self, _attempts: u32) {}
    fn frame_rejected(&self, _reason: &'static str) {}
    fn event_relayed(&self) {}
    fn command_rejected_queue_full(&self) {}
    fn command_sent(&self, _id: &str) {}
    fn command_acked(&self, _id: &str) {}
    fn command_retried(&self, _id: &str, _retry_count: u32) {}
    fn command_dropped(&self, _id: &str, _retry_count: u32) {}
}

/// Default sink: structured log lines at debug/warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl GatewayMetrics for TracingMetrics {
    fn state_changed(&self, state: ConnectionState) {
        tracing::debug!(?state, "gateway state changed");
    }

    fn reconnect_scheduled(&self, attempt: u32, delay: Duration) {
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "gateway reconnect scheduled");
    }

    fn reconnect_exhausted(&self, attempts: u32) {
        tracing::warn!(attempts, "gateway reconnect attempts exhausted");
    }

    fn frame_rejected(&self, reason: &'static str) {
        tracing::debug!(reason, "gateway frame rejected");
    }

    fn command_rejected_queue_full(&self) {
        tracing::warn!("gateway command rejected: queue full");
    }

    fn command_dropped(&self, id: &str, retry_count: u32) {
        tracing::warn!(command_id = id, retry_count, "gateway command dropped");
    }
}
