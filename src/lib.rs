pub mod configuration;
pub mod console;
pub mod database;
pub mod driver;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod model;
pub mod pool;
pub mod reconciler;
pub mod service;
pub mod session;
pub mod startup;
pub mod subscriptions;
pub mod telemetry;

use std::sync::Arc;

use crate::service::HostService;

/// Shared handler state: the control-plane facade everything dispatches to.
#[derive(Clone)]
pub struct App {
    service: Arc<HostService>,
}

impl App {
    pub fn new(service: Arc<HostService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<HostService> {
        &self.service
    }
}
