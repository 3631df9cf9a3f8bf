use std::{fmt::Write as _, fs::File, path::Path};

use minimc_process::LogLevel;
use tracing::{Level, Subscriber, field::Field};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::Context, prelude::*};

use crate::log_hub::LogHub;

/// Events under this target were already published to the hub by whoever emitted them.
pub const CONSOLE_TARGET: &str = "console";

pub const LATEST_LOG: &str = "latest.log";

/// Only the agent's own crates reach the web console; dependency chatter stays in the log file.
const FORWARDED_TARGET_PREFIX: &str = "minimc";

/// Forwards agent log events into the hub so they show up in the web console.
pub struct HubLayer {
    hub: LogHub,
}

impl HubLayer {
    pub fn new(hub: LogHub) -> Self {
        Self { hub }
    }
}

fn hub_level(level: &Level) -> Option<LogLevel> {
    match *level {
        Level::ERROR => Some(LogLevel::Error),
        Level::WARN => Some(LogLevel::Warning),
        Level::INFO => Some(LogLevel::Info),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for HubLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target == CONSOLE_TARGET || !target.starts_with(FORWARDED_TARGET_PREFIX) {
            return;
        }
        let Some(level) = hub_level(metadata.level()) else {
            return;
        };

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.hub.publish(level, visitor.finish());
    }
}

/// Renders `message key=value ...` the way the fmt layer would, minus colours.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: &dyn std::fmt::Display) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), &format_args!("{value:?}"));
        }
    }
}

/// Installs the global subscriber: stdout, `latest.log` in `log_dir` (truncated on start),
/// and the hub. Keep the guard alive until exit or buffered file output is lost.
pub fn init(hub: LogHub, log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file = File::create(log_dir.join(LATEST_LOG))?;
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .with(HubLayer::new(hub))
        .try_init()?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_hub_layer(hub: &LogHub, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(HubLayer::new(hub.clone()));
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn agent_events_reach_the_hub_with_fields() {
        let hub = LogHub::default();
        with_hub_layer(&hub, || {
            tracing::info!(target: "minimc_agent::paper", version = "1.21.4", "download complete");
            tracing::warn!(target: "minimc_agent", "disk almost full");
            tracing::debug!(target: "minimc_agent", "noise");
        });

        let lines = hub.snapshot();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].level, LogLevel::Info);
        assert_eq!(lines[0].text, "download complete version=1.21.4");
        assert_eq!(lines[1].level, LogLevel::Warning);
        assert_eq!(lines[1].text, "disk almost full");
    }

    #[test]
    fn console_and_foreign_targets_are_skipped() {
        let hub = LogHub::default();
        with_hub_layer(&hub, || {
            tracing::info!(target: "console", "already published");
            tracing::error!(target: "hyper::proto", "connection reset");
        });
        assert!(hub.snapshot().is_empty());
    }
}
