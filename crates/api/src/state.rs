//! Application state

use std::sync::Arc;

use payrail_billing::BillingService;

/// Shared application state: the assembled billing service.
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(billing: Arc<BillingService>) -> Self {
        Self { billing }
    }
}
