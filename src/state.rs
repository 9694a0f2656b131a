use crate::config::Config;
use crate::crypto::HandshakeService;
use crate::services::MessageGateway;
use crate::websocket::SessionConnectionRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionConnectionRegistry,
    pub gateway: Arc<MessageGateway>,
    pub handshake: Arc<HandshakeService>,
}
