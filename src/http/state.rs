//! Shared application state for the HTTP server.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::detect::Detector;
use crate::metrics::MonitorMetrics;
use crate::store::SharedStore;

/// Everything a handler can reach, threaded through the router. All
/// fields are shared handles; cloning the state is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub store: SharedStore,
    pub bus: Arc<EventBus>,
    pub detector: Arc<Detector>,
    pub metrics: Arc<MonitorMetrics>,
}
