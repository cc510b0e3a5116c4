pub mod api;
pub mod api_keys;
pub mod circuit_breaker;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod metrics_defs;
pub mod node;
pub mod outcome;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::api::DispatchService;
use crate::config::{Config, ValidationError};
use crate::dispatcher::Dispatcher;
use shared::admin_service::AdminService;
use shared::http::run_http_service;

#[derive(thiserror::Error, Debug)]
pub enum DispatchServiceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),
}

/// Serves dispatch traffic and the admin endpoints until either listener fails.
pub async fn run(config: Config) -> Result<(), DispatchServiceError> {
    let dispatcher = Dispatcher::from_config(&config)?;

    let dispatch_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        DispatchService::new(dispatcher.clone()),
    );

    let ready = dispatcher.clone();
    let status = dispatcher;
    let admin_service: AdminService<_, _, DispatchServiceError> =
        AdminService::new(move || ready.is_ready(), move || status.status());
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::try_join!(dispatch_task, admin_task)?;
    Ok(())
}
