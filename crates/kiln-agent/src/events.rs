use std::collections::VecDeque;
use std::sync::Arc;

use kiln_workload::{LogEvent, LogSeverity};
use tokio::sync::{Mutex, mpsc};

use crate::support::log_max_lines;

/// Bounded in-memory ring of user-visible log events with a cursor-based
/// poll API for the control surface.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    events: VecDeque<(u64, LogEvent)>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self {
            next_seq: 1,
            max_lines: log_max_lines(),
            events: VecDeque::new(),
        }
    }
}

impl LogBuffer {
    fn push(&mut self, event: LogEvent) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.events.push_back((seq, event));
        while self.events.len() > self.max_lines {
            self.events.pop_front();
        }
    }

    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<LogEvent>, u64) {
        // Cursor 0 means "give me the most recent events".
        if cursor == 0 {
            let start = self.events.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, ev) in self.events.iter().skip(start) {
                out.push(ev.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, ev) in self.events.iter() {
            if *seq > cursor {
                out.push(ev.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Fan-out handle: every controller/manager operation that produces a
/// user-visible event emits through one of these. Events land in the ring
/// buffer and, when a forwarder is attached, on the channel feeding the
/// shell's log surface. Consumers must drain the channel; it is unbounded.
#[derive(Clone, Default)]
pub struct LogSink {
    buffer: Arc<Mutex<LogBuffer>>,
    forward_tx: Option<mpsc::UnboundedSender<LogEvent>>,
}

impl LogSink {
    pub fn with_forwarder() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                buffer: Arc::new(Mutex::new(LogBuffer::default())),
                forward_tx: Some(tx),
            },
            rx,
        )
    }

    pub async fn emit(&self, severity: LogSeverity, message: impl Into<String>) {
        let event = LogEvent::new(message, severity);
        match severity {
            LogSeverity::Error => tracing::error!(message = %event.message),
            _ => tracing::info!(message = %event.message),
        }
        self.buffer.lock().await.push(event.clone());
        if let Some(tx) = &self.forward_tx {
            let _ = tx.send(event);
        }
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.emit(LogSeverity::Info, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.emit(LogSeverity::Error, message).await;
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.emit(LogSeverity::Success, message).await;
    }

    pub async fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<LogEvent>, u64) {
        self.buffer.lock().await.tail_after(cursor, limit)
    }
}
