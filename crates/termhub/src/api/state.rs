//! Application state shared across handlers.

use std::sync::Arc;

use crate::exec::CommandExecutor;
use crate::gateway::StreamingGateway;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<StreamingGateway>,
    /// Shared API key; `None` disables authentication.
    pub api_key: Option<Arc<str>>,
    /// Allowed CORS origins. Empty allows any origin.
    pub allowed_origins: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(gateway: Arc<StreamingGateway>) -> Self {
        Self {
            gateway,
            api_key: None,
            allowed_origins: Arc::new(Vec::new()),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty()).map(Arc::from);
        self
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Arc::new(origins);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.gateway.registry()
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        self.gateway.executor()
    }
}
