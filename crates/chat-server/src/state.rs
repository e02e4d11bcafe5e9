//! Application State

use std::sync::Arc;

use chat_core::ChatService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Turn orchestration, conversation store and provider registry
    pub service: ChatService,

    /// Names of the registered tools, for the health report
    pub tool_names: Arc<Vec<&'static str>>,
}

impl AppState {
    pub fn new(service: ChatService, tool_names: Vec<&'static str>) -> Self {
        Self {
            service,
            tool_names: Arc::new(tool_names),
        }
    }
}
