use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{files::FileTree, log_hub::LogHub, supervisor::Supervisor};

/// Operator credentials checked by the Basic auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub hub: LogHub,
    pub files: FileTree,
    pub credentials: Arc<Credentials>,
    /// Cancelled when the agent shuts down; ends long-lived responses such as the log stream.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        supervisor: Supervisor,
        files: FileTree,
        credentials: Credentials,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub: supervisor.hub().clone(),
            supervisor,
            files,
            credentials: Arc::new(credentials),
            shutdown,
        }
    }
}
