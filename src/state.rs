use std::sync::Arc;

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::gateway::GatewayConnection;
use crate::invite::RoomInviteTokenService;

#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    /// `None` when no upstream is configured.
    pub gateway: Option<GatewayConnection>,
    pub invites: Arc<RoomInviteTokenService>,
    pub webhook_secret: Arc<[u8]>,
    pub webhook_max_skew_secs: u64,
    pub clock: Arc<dyn Clock>,
}
