use std::sync::Arc;

use crate::services::{
    contacts::ContactBook,
    intake::IntakeService,
    store::JobStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub intake: Arc<IntakeService>,
    pub contacts: Arc<ContactBook>,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, intake: IntakeService, contacts: Arc<ContactBook>) -> Self {
        Self {
            store,
            intake: Arc::new(intake),
            contacts,
        }
    }
}
