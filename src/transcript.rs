//! Conversation transcript and bounded context window

use std::collections::VecDeque;

/// Maximum finalized turns kept for delegation context
pub const CONTEXT_CAPACITY: usize = 10;

/// One transcript entry
#[derive(Debug, Clone)]
struct Entry {
    text: String,
    streaming: bool,
}

/// Ordered, append-only conversation log.
///
/// Entries are immutable once written, with one exception: the most recent
/// entry, while still streaming, is extended in place by incoming text deltas
/// until it is finalized with a speaker role.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Vec<Entry>,
}

impl TranscriptLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a finalized entry (markers, user turns).
    pub fn append(&mut self, text: &str) {
        self.entries.push(Entry {
            text: text.to_string(),
            streaming: false,
        });
    }

    /// Extend the streaming entry by `delta`, creating it if the last entry is
    /// already finalized. Returns the accumulated streaming text.
    pub fn extend_streaming(&mut self, delta: &str) -> String {
        match self.entries.last_mut() {
            Some(entry) if entry.streaming => entry.text.push_str(delta),
            _ => self.entries.push(Entry {
                text: delta.to_string(),
                streaming: true,
            }),
        }
        self.entries
            .last()
            .map(|e| e.text.clone())
            .unwrap_or_default()
    }

    /// Finalize the streaming entry as a turn by `role`.
    ///
    /// Prefers the service's full `text` when given (it is authoritative for
    /// the turn), falling back to the accumulated deltas. Returns the final
    /// entry text.
    pub fn finalize_streaming(&mut self, role: &str, text: &str) -> String {
        let body = if text.is_empty() {
            match self.entries.last() {
                Some(entry) if entry.streaming => entry.text.clone(),
                _ => String::new(),
            }
        } else {
            text.to_string()
        };
        let line = format!("{role}: {body}");
        match self.entries.last_mut() {
            Some(entry) if entry.streaming => {
                entry.text = line.clone();
                entry.streaming = false;
            }
            _ => self.append(&line),
        }
        line
    }

    /// Whether the most recent entry is still streaming.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.entries.last().is_some_and(|e| e.streaming)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry texts in insertion order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.text.clone()).collect()
    }

    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.entries.last().map(|e| e.text.as_str())
    }
}

/// Bounded FIFO of the most recent finalized turns
#[derive(Debug, Default)]
pub struct ContextWindow {
    turns: VecDeque<String>,
}

impl ContextWindow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a finalized turn, evicting the oldest past capacity.
    pub fn push(&mut self, turn: String) {
        self.turns.push_back(turn);
        while self.turns.len() > CONTEXT_CAPACITY {
            self.turns.pop_front();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The last `n` turns joined with newlines, oldest first.
    #[must_use]
    pub fn recent_joined(&self, n: usize) -> String {
        let skip = self.turns.len().saturating_sub(n);
        self.turns
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}
