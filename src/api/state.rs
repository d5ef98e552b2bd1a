use std::sync::Arc;

use crate::scheduler::Monitor;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub monitor: Arc<Monitor>,
}
