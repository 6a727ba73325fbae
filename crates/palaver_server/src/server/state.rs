#![forbid(unsafe_code)]

use std::sync::Arc;

use palaver_auth::AuthProvider;

use crate::server::registry::Registry;
use crate::server::store::DataStore;

/// Process-wide server state, constructed once at startup and passed
/// explicitly into every connection task.
pub struct ServerState {
	pub registry: Registry,
	pub store: Arc<dyn DataStore>,
	pub auth: Arc<dyn AuthProvider>,
}

impl ServerState {
	pub fn new(store: Arc<dyn DataStore>, auth: Arc<dyn AuthProvider>) -> Self {
		Self {
			registry: Registry::new(),
			store,
			auth,
		}
	}
}
