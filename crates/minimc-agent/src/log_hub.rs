use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use minimc_process::{LogLevel, LogLine};
use tokio::sync::mpsc::{self, error::TrySendError};

pub const DEFAULT_HISTORY_LINES: usize = 1000;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug)]
struct HubInner {
    next_seq: u64,
    max_lines: usize,
    history: VecDeque<LogLine>,
    subscribers: Vec<mpsc::Sender<LogLine>>,
}

impl HubInner {
    fn push(&mut self, level: LogLevel, text: String) -> LogLine {
        let line = LogLine {
            seq: self.next_seq,
            level,
            text,
            at_unix_ms: now_unix_ms(),
        };
        self.next_seq = self.next_seq.saturating_add(1);

        self.history.push_back(line.clone());
        while self.history.len() > self.max_lines {
            self.history.pop_front();
        }

        // Fan out under the same lock as the append so a subscriber never misses a line
        // that history already holds. Full buffers drop; closed receivers are pruned.
        self.subscribers.retain(|tx| match tx.try_send(line.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });

        line
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<LogLine>, u64) {
        // cursor 0: the most recent `limit` lines.
        if cursor == 0 {
            let start = self.history.len().saturating_sub(limit);
            let out: Vec<LogLine> = self.history.iter().skip(start).cloned().collect();
            let last = out.last().map(|l| l.seq).unwrap_or(0);
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for line in self.history.iter().filter(|l| l.seq > cursor) {
            last = line.seq;
            out.push(line.clone());
            if out.len() >= limit {
                break;
            }
        }
        (out, last)
    }
}

/// Process-wide console log: a bounded replay history plus live fan-out.
///
/// Publishing never waits on subscribers. Each subscriber gets its own bounded buffer and
/// silently loses lines when it falls behind.
#[derive(Debug, Clone)]
pub struct LogHub {
    inner: Arc<Mutex<HubInner>>,
    subscriber_buffer: usize,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LINES, DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl LogHub {
    pub fn new(max_lines: usize, subscriber_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                next_seq: 1,
                max_lines: max_lines.max(1),
                history: VecDeque::new(),
                subscribers: Vec::new(),
            })),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publish(&self, level: LogLevel, text: impl Into<String>) -> LogLine {
        self.lock().push(level, text.into())
    }

    pub fn info(&self, text: impl Into<String>) -> LogLine {
        self.publish(LogLevel::Info, text)
    }

    pub fn warn(&self, text: impl Into<String>) -> LogLine {
        self.publish(LogLevel::Warning, text)
    }

    pub fn error(&self, text: impl Into<String>) -> LogLine {
        self.publish(LogLevel::Error, text)
    }

    pub fn subscribe(&self) -> LogSubscription {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        self.lock().subscribers.push(tx);
        LogSubscription { rx }
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lock().history.iter().cloned().collect()
    }

    /// Snapshot and registration under one lock: the replay ends exactly where the live
    /// stream begins.
    pub fn subscribe_with_snapshot(&self) -> (Vec<LogLine>, LogSubscription) {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let mut inner = self.lock();
        let history = inner.history.iter().cloned().collect();
        inner.subscribers.push(tx);
        (history, LogSubscription { rx })
    }

    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<LogLine>, u64) {
        self.lock().tail_after(cursor, limit.max(1))
    }

    /// Includes subscribers that disconnected since the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Sequence number of the most recently published line, 0 if none.
    pub fn last_seq(&self) -> u64 {
        self.lock().next_seq.saturating_sub(1)
    }
}

/// Live side of a hub subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct LogSubscription {
    rx: mpsc::Receiver<LogLine>,
}

impl LogSubscription {
    pub async fn recv(&mut self) -> Option<LogLine> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogLine> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> impl futures_util::Stream<Item = LogLine> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|line| (line, sub))
        })
    }
}
