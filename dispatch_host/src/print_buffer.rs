//! FIFO of pending G-code lines plus the progress counters derived from it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// A queued line. Only lines of the loaded print count towards progress;
/// pause and restore moves are injected uncounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedLine {
    pub text: String,
    pub counted: bool,
}

impl BufferedLine {
    pub fn print(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            counted: true,
        }
    }

    pub fn injected(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            counted: false,
        }
    }
}

/// Outcome of a non-blocking pop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Popped {
    /// Another task holds the buffer lock.
    Contended,
    Empty,
    Line(BufferedLine),
}

#[derive(Debug, Default)]
pub struct PrintBuffer {
    lines: Mutex<VecDeque<BufferedLine>>,
    current_line: AtomicU64,
    total_lines: AtomicU64,
}

impl PrintBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the buffer with a new print. The total is fixed here.
    pub async fn load(&self, lines: Vec<String>) {
        let mut buffer = self.lines.lock().await;
        buffer.clear();
        self.total_lines.store(lines.len() as u64, Ordering::SeqCst);
        self.current_line.store(0, Ordering::SeqCst);
        buffer.extend(lines.into_iter().map(BufferedLine::print));
    }

    /// Out-of-band append; does not change the total.
    pub async fn push_back(&self, line: impl Into<String>) {
        self.lines.lock().await.push_back(BufferedLine::injected(line));
    }

    /// Prepend uncounted `lines` so they run next, in the given order.
    pub async fn push_front(&self, lines: Vec<String>) {
        let mut buffer = self.lines.lock().await;
        for line in lines.into_iter().rev() {
            buffer.push_front(BufferedLine::injected(line));
        }
    }

    /// Insert uncounted `lines` starting at `index` (clamped to the buffer length).
    pub async fn insert_at(&self, index: usize, lines: Vec<String>) {
        let mut buffer = self.lines.lock().await;
        let mut at = index.min(buffer.len());
        for line in lines {
            buffer.insert(at, BufferedLine::injected(line));
            at += 1;
        }
    }

    /// Drop every pending line. Returns how many were discarded.
    pub async fn clear(&self) -> usize {
        let mut buffer = self.lines.lock().await;
        let dropped = buffer.len();
        buffer.clear();
        dropped
    }

    pub fn try_pop(&self) -> Popped {
        match self.lines.try_lock() {
            Ok(mut buffer) => match buffer.pop_front() {
                Some(line) => Popped::Line(line),
                None => Popped::Empty,
            },
            Err(_) => Popped::Contended,
        }
    }

    /// Record `line` as delivered. Injected lines leave progress alone.
    pub fn mark_sent(&self, line: &BufferedLine) {
        if line.counted {
            self.current_line.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn current_line(&self) -> u64 {
        self.current_line.load(Ordering::SeqCst)
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines.load(Ordering::SeqCst)
    }

    /// Floor of sent / total, capped at 100. Zero until a print is loaded.
    pub fn percent(&self) -> u8 {
        let total = self.total_lines();
        if total == 0 {
            return 0;
        }
        (self.current_line() * 100 / total).min(100) as u8
    }

    pub async fn len(&self) -> usize {
        self.lines.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lines.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.lines.lock().await.iter().map(|line| line.text.clone()).collect()
    }
}
