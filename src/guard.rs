use std::collections::VecDeque;

/// Fragments retained for comparison.
pub const HISTORY_LIMIT: usize = 5;

/// Repeats at or below this trimmed length are treated as ordinary tokens.
pub const MIN_RUNAWAY_CHARS: usize = 10;

pub const OUTPUT_ENDED_MARKER: &str = "\n[output ended]";

/// Formatting that models tend to echo verbatim once they finish an answer.
const FORMATTED_MARKERS: [&str; 5] = ["\\boxed", "$", "```", "**Answer**", "**答案**"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Forward,
    /// Emit [`OUTPUT_ENDED_MARKER`] and end normally.
    EndWithMarker,
    /// End silently without forwarding the fragment.
    Stop,
}

impl GuardVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardVerdict::Forward => "forward",
            GuardVerdict::EndWithMarker => "marker",
            GuardVerdict::Stop => "stop",
        }
    }
}

/// Detects a generation that has started looping on the same fragment.
#[derive(Debug, Default)]
pub struct RepetitionGuard {
    recent: VecDeque<String>,
    cut: bool,
}

impl RepetitionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cut(&self) -> bool {
        self.cut
    }

    pub fn observe(&mut self, fragment: &str) -> GuardVerdict {
        if self.cut {
            return GuardVerdict::Stop;
        }

        self.recent.push_back(fragment.to_owned());
        if self.recent.len() > HISTORY_LIMIT {
            self.recent.pop_front();
        }

        let verdict = self.judge(fragment);
        if verdict != GuardVerdict::Forward {
            self.cut = true;
        }
        verdict
    }

    fn judge(&self, newest: &str) -> GuardVerdict {
        let len = self.recent.len();
        if len < 2 {
            return GuardVerdict::Forward;
        }

        let previous = self.recent[len - 2].trim();
        let current = self.recent[len - 1].trim();
        if current.is_empty() || previous != current {
            return GuardVerdict::Forward;
        }

        if FORMATTED_MARKERS.iter().any(|marker| newest.contains(marker)) {
            GuardVerdict::EndWithMarker
        } else if current.chars().count() > MIN_RUNAWAY_CHARS {
            GuardVerdict::Stop
        } else {
            GuardVerdict::Forward
        }
    }
}
