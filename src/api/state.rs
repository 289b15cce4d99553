use std::sync::Arc;

use crate::gate::ConfirmationGate;
use crate::queue::QueueHandle;

#[derive(Clone)]
pub struct AppState {
    pub queue: QueueHandle,
    pub gate: Arc<ConfirmationGate>,
}
