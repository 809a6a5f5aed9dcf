use std::mem;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::EngineError;

/// Lifecycle of one micro-batch. Each step happens at most once and in order;
/// `Discarded` is terminal and reachable from `Closed` (overflow/shutdown
/// drop), `Processing` (scoring timeout) or `Published`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatchState {
    Open,
    Closed,
    Processing,
    Published,
    Discarded,
}

impl BatchState {
    pub fn can_advance_to(self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Open, Closed)
                | (Closed, Processing)
                | (Closed, Discarded)
                | (Processing, Published)
                | (Processing, Discarded)
                | (Published, Discarded)
        )
    }
}

/// Lines collected for the interval starting at `opened_at`.
#[derive(Debug)]
pub struct Window {
    seq: u64,
    opened_at: DateTime<Utc>,
    lines: Vec<String>,
}

impl Window {
    pub fn new(seq: u64, opened_at: DateTime<Utc>) -> Self {
        Self { seq, opened_at, lines: Vec::new() }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// The single open window, shared between the line collector and the timer.
pub struct WindowBuffer {
    open: Mutex<Window>,
}

impl WindowBuffer {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { open: Mutex::new(Window::new(0, now)) }
    }

    pub fn push(&self, line: String) {
        self.open.lock().unwrap_or_else(|e| e.into_inner()).push(line);
    }

    pub fn open_len(&self) -> usize {
        self.open.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Swap a fresh window in under the lock and hand back the one that was
    /// open. Lines pushed concurrently land in exactly one of the two.
    pub fn rotate(&self, now: DateTime<Utc>) -> Window {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        let next = Window::new(open.seq + 1, now);
        mem::replace(&mut *open, next)
    }
}

/// A closed window travelling through processing.
#[derive(Debug)]
pub struct Batch {
    window: Window,
    state: BatchState,
    closed_at: Instant,
}

impl Batch {
    pub fn close(window: Window) -> Self {
        Self { window, state: BatchState::Closed, closed_at: Instant::now() }
    }

    pub fn seq(&self) -> u64 {
        self.window.seq
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window.opened_at
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn closed_at(&self) -> Instant {
        self.closed_at
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn advance(&mut self, next: BatchState) -> Result<(), EngineError> {
        if !self.state.can_advance_to(next) {
            return Err(EngineError::InvalidTransition { seq: self.seq(), from: self.state, to: next });
        }
        self.state = next;
        Ok(())
    }

    /// Move the lines out for scoring. Only legal while processing.
    pub fn take_lines(&mut self) -> Vec<String> {
        debug_assert_eq!(self.state, BatchState::Processing);
        mem::take(&mut self.window.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rotate_swaps_in_empty_window() {
        let buffer = WindowBuffer::new(Utc::now());
        buffer.push("a".into());
        buffer.push("b".into());

        let closed = buffer.rotate(Utc::now());
        assert_eq!(closed.seq(), 0);
        assert_eq!(closed.len(), 2);
        assert_eq!(buffer.open_len(), 0);

        buffer.push("c".into());
        let next = buffer.rotate(Utc::now());
        assert_eq!(next.seq(), 1);
        assert_eq!(next.len(), 1);
        assert!(next.opened_at() >= closed.opened_at());
    }

    #[test]
    fn concurrent_pushes_are_never_lost() {
        let buffer = Arc::new(WindowBuffer::new(Utc::now()));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        buffer.push(format!("{w}-{i}"));
                    }
                })
            })
            .collect();

        let mut seen = 0;
        for _ in 0..50 {
            seen += buffer.rotate(Utc::now()).len();
        }
        for w in writers {
            w.join().unwrap();
        }
        seen += buffer.rotate(Utc::now()).len();
        assert_eq!(seen, 4_000);
    }

    #[test]
    fn state_machine_is_strictly_forward() {
        let mut batch = Batch::close(Window::new(7, Utc::now()));
        assert_eq!(batch.state(), BatchState::Closed);
        assert!(batch.advance(BatchState::Published).is_err());
        batch.advance(BatchState::Processing).unwrap();
        assert!(batch.advance(BatchState::Closed).is_err());
        batch.advance(BatchState::Published).unwrap();
        assert!(batch.advance(BatchState::Processing).is_err());
        batch.advance(BatchState::Discarded).unwrap();
        assert!(batch.advance(BatchState::Discarded).is_err());
    }

    #[test]
    fn closed_batch_can_be_dropped() {
        let mut batch = Batch::close(Window::new(1, Utc::now()));
        batch.advance(BatchState::Discarded).unwrap();
        assert_eq!(batch.state(), BatchState::Discarded);
    }
}
