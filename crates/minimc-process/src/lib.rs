/// Identifies one run of the supervised server, from spawn to exit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl SupervisorState {
    /// Running or asked to stop but not yet exited. Console commands are accepted.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    /// Holds the singleton slot: a second start must be rejected.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Terminated)
    }
}

/// Display classification attached to every console line when it is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    /// Output of the game server itself.
    Raw,
}

impl LogLevel {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Info => "[i]",
            Self::Warning => "[w]",
            Self::Error => "[e]",
            Self::Raw => "[g]",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub level: LogLevel,
    pub text: String,
    pub at_unix_ms: u64,
}

impl LogLine {
    /// The line as the web console shows it: level prefix, a space, then the text.
    pub fn render(&self) -> String {
        format!("{} {}", self.level.prefix(), self.text)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub running: bool,
    pub state: SupervisorState,
    pub run_id: Option<RunId>,
    pub pid: Option<u32>,
}

impl ServerStatus {
    pub fn idle() -> Self {
        Self {
            running: false,
            state: SupervisorState::Idle,
            run_id: None,
            pid: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_non_empty() {
        let id = RunId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, RunId::new());
    }

    #[test]
    fn stopping_still_counts_as_running() {
        assert!(SupervisorState::Stopping.is_running());
        assert!(SupervisorState::Running.is_running());
        assert!(!SupervisorState::Starting.is_running());
        assert!(SupervisorState::Starting.is_active());
        assert!(!SupervisorState::Terminated.is_active());
        assert!(!SupervisorState::Idle.is_active());
    }

    #[test]
    fn render_prepends_prefix() {
        let line = LogLine {
            seq: 7,
            level: LogLevel::Warning,
            text: "low disk".to_string(),
            at_unix_ms: 0,
        };
        assert_eq!(line.render(), "[w] low disk");
    }

    #[test]
    fn status_serializes_snake_case_state() {
        let v = serde_json::to_value(ServerStatus::idle()).unwrap();
        assert_eq!(v["state"], "idle");
        assert_eq!(v["running"], false);
    }
}
