#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("a server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error("command queue is full")]
    QueueFull,
    #[error("console input is closed")]
    InputClosed,
    #[error("a console command must be a single line")]
    InvalidCommand,
    #[error("failed to launch server: {0}")]
    LaunchFailure(#[source] std::io::Error),
    #[error("failed to signal server process: {0}")]
    Os(#[source] std::io::Error),
}

impl SupervisorError {
    /// Stable identifier for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
            Self::QueueFull => "queue_full",
            Self::InputClosed => "input_closed",
            Self::InvalidCommand => "invalid_command",
            Self::LaunchFailure(_) => "launch_failed",
            Self::Os(_) => "os_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_failure_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no java");
        let err = SupervisorError::LaunchFailure(io);
        assert_eq!(err.code(), "launch_failed");
        assert!(err.to_string().contains("no java"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
