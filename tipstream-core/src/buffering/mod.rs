//! Pending-text accumulator.
//!
//! Producers (HTTP notifications, transcribed audio) append in bursts; the
//! worker drains everything at once so one remote request covers many short
//! utterances. Both operations hold the lock only for a string copy/swap.

use parking_lot::Mutex;

/// Separator inserted before every appended utterance.
pub const SEPARATOR: char = '\n';

/// Thread-safe append buffer with extract-and-clear semantics.
#[derive(Debug, Default)]
pub struct PendingText {
    buf: Mutex<String>,
}

impl PendingText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` preceded by [`SEPARATOR`]. Blank input is ignored.
    pub fn append(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut buf = self.buf.lock();
        buf.push(SEPARATOR);
        buf.push_str(text);
    }

    /// Take everything pending, leaving the buffer empty.
    ///
    /// Returns `None` without touching the buffer when nothing is pending.
    pub fn drain_all(&self) -> Option<String> {
        let mut buf = self.buf.lock();
        if buf.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *buf))
    }

    /// Bytes currently pending.
    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn drain_returns_appends_in_call_order_then_nothing() {
        let pending = PendingText::new();
        pending.append("the players open a door");
        pending.append("  the rogue checks for traps ");

        assert_eq!(
            pending.drain_all().as_deref(),
            Some("\nthe players open a door\nthe rogue checks for traps")
        );
        assert_eq!(pending.drain_all(), None);
        assert!(pending.is_empty());
    }

    #[test]
    fn blank_input_does_not_schedule_work() {
        let pending = PendingText::new();
        pending.append("");
        pending.append("   \n ");
        assert_eq!(pending.len(), 0);
        assert_eq!(pending.drain_all(), None);
    }

    #[test]
    fn appends_after_drain_land_in_next_drain() {
        let pending = PendingText::new();
        pending.append("first");
        let first = pending.drain_all();
        pending.append("second");
        assert_eq!(first.as_deref(), Some("\nfirst"));
        assert_eq!(pending.drain_all().as_deref(), Some("\nsecond"));
    }

    #[test]
    fn concurrent_producers_never_tear_utterances() {
        let pending = Arc::new(PendingText::new());
        let producers: Vec<_> = (0..8)
            .map(|p| {
                let pending = Arc::clone(&pending);
                thread::spawn(move || {
                    for i in 0..200 {
                        pending.append(&format!("p{p}-u{i}"));
                    }
                })
            })
            .collect();

        let mut drained = String::new();
        while producers.iter().any(|h| !h.is_finished()) {
            if let Some(chunk) = pending.drain_all() {
                drained.push_str(&chunk);
            }
        }
        for handle in producers {
            handle.join().expect("producer panicked");
        }
        if let Some(rest) = pending.drain_all() {
            drained.push_str(&rest);
        }

        let lines: Vec<&str> = drained.split(SEPARATOR).filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 8 * 200);
        for p in 0..8 {
            let mine: Vec<&str> = lines
                .iter()
                .copied()
                .filter(|l| l.starts_with(&format!("p{p}-")))
                .collect();
            let expected: Vec<String> = (0..200).map(|i| format!("p{p}-u{i}")).collect();
            assert_eq!(mine, expected, "producer {p} order or content torn");
        }
    }
}
