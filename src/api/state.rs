use std::sync::Arc;

use crate::detect::incident::IncidentStore;
use crate::ingest::LogBuffer;

#[derive(Clone)]
pub struct AppState {
    pub buffer: Arc<LogBuffer>,
    pub incidents: IncidentStore,
}
