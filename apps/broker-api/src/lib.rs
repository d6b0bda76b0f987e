pub mod broker;
pub mod bus;
pub mod config;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use tokio::sync::mpsc;

use broker::events::BusPublish;
use broker::BrokerHandle;
use config::Config;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broker: BrokerHandle,
    pub publish: mpsc::Sender<BusPublish>,
}
