use std::{collections::VecDeque, sync::Arc};

use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug)]
struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // cursor 0 means "latest `limit` lines" for the initial UI poll.
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter().filter(|(seq, _)| *seq > cursor) {
            out.push(line.clone());
            last = *seq;
            if out.len() >= limit {
                break;
            }
        }
        (out, last)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogTail {
    pub lines: Vec<String>,
    pub next_cursor: u64,
}

/// Bounded, sequence-numbered log of everything the run pipeline prints.
#[derive(Clone)]
pub struct RunLog {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl RunLog {
    pub fn new(max_lines: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::new(max_lines))),
        }
    }

    pub async fn emit(&self, line: impl Into<String>) {
        self.buffer.lock().await.push_line(line.into());
    }

    pub async fn tail(&self, cursor: u64, limit: usize) -> LogTail {
        let (lines, next_cursor) = self.buffer.lock().await.tail_after(cursor, limit.max(1));
        LogTail { lines, next_cursor }
    }
}
