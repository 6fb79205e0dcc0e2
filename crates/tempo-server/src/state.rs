//! Shared application state handed to every route handler.
use std::sync::Arc;

use tempo_core::admission::AdmissionController;
use tempo_core::registry::ActiveRunRegistry;
use tempo_core::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<ActiveRunRegistry>,
    pub admission: Arc<AdmissionController>,
}
