//! Language stabilizer: majority vote over the last few utterances.

use std::collections::VecDeque;

use super::state::Language;

pub const DEFAULT_HISTORY_CAPACITY: usize = 3;

/// Result of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stabilized {
    pub language: Language,
    pub previous: Language,
    /// The stabilized language changed; the recognizer must restart.
    pub switched: bool,
}

#[derive(Debug, Clone)]
pub struct LanguageStabilizer {
    history: VecDeque<Language>,
    capacity: usize,
    stable: Language,
}

impl LanguageStabilizer {
    /// `seed` is the language in effect before any observation.
    pub fn new(capacity: usize, seed: Language) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity + 1),
            capacity,
            stable: seed,
        }
    }

    pub fn current(&self) -> Language {
        self.stable
    }

    pub fn history(&self) -> impl Iterator<Item = Language> + '_ {
        self.history.iter().copied()
    }

    /// Record one detected tag and return the stabilized language.
    ///
    /// `Unknown` observations are not recorded and never cause a switch.
    pub fn observe(&mut self, detected: Language) -> Stabilized {
        let previous = self.stable;
        if !detected.is_known() {
            return Stabilized {
                language: previous,
                previous,
                switched: false,
            };
        }

        self.history.push_back(detected);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }

        let majority = majority(&self.history).unwrap_or(previous);
        self.stable = majority;
        Stabilized {
            language: majority,
            previous,
            switched: majority != previous,
        }
    }

    /// Forget the history and start over from `seed`.
    pub fn reset(&mut self, seed: Language) {
        self.history.clear();
        self.stable = seed;
    }
}

/// Most frequent tag; ties go to the tag seen most recently.
fn majority(history: &VecDeque<Language>) -> Option<Language> {
    let mut best: Option<(Language, usize, usize)> = None;
    for (idx, &lang) in history.iter().enumerate() {
        let count = history.iter().filter(|&&l| l == lang).count();
        let last_seen = idx;
        best = match best {
            Some((_, best_count, best_seen))
                if count < best_count || (count == best_count && last_seen < best_seen) =>
            {
                best
            }
            _ => Some((lang, count, last_seen)),
        };
    }
    best.map(|(lang, _, _)| lang)
}
