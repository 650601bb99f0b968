//! Broker events and per-server connection status.

use crate::gateway::types::Target;

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ConnectionChanged { server_id: String, connected: bool },
    TargetsRefreshed { server_id: String },
    ServersMutated,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_error: Option<String>,
    /// Unix timestamp in milliseconds.
    pub last_checked: Option<u64>,
    pub targets: Vec<Target>,
}
