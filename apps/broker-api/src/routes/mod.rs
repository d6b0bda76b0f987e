pub mod health;
pub mod introspect;

use axum::Router;

use crate::config::Config;
use crate::AppState;

pub fn router(config: &Config) -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(introspect::router())
        .merge(crate::gateway::server::router(config))
}
