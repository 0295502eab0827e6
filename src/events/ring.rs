//! Fixed-capacity ring of recent log lines
//!
//! Backs the pull endpoint (`GET /api/logs`) while the push channel serves
//! live subscribers. Oldest lines fall off; pushes never block.

use parking_lot::Mutex;
use std::collections::VecDeque;

use super::types::LogLine;

#[derive(Debug)]
pub struct LogRing {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
}

impl LogRing {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: LogLine) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Most recent `n` lines, oldest first
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(LogLine::new("info", format!("line {i}")));
        }
        let tail = ring.tail(10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].message, "line 2");
        assert_eq!(tail[2].message, "line 4");
    }

    #[test]
    fn tail_returns_requested_suffix() {
        let ring = LogRing::new(10);
        for i in 0..6 {
            ring.push(LogLine::new("info", format!("line {i}")));
        }
        let tail = ring.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "line 4");
        assert_eq!(tail[1].message, "line 5");
    }
}
