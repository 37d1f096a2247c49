//! Progress extraction from IPED console output.
//!
//! IPED reports progress with lines such as
//!
//! ```text
//! 2020-04-24 15:12:43 [MSG] [indexer.process.ProgressConsole] Processando 2153/3591 (7%) 64GB/h Termino em 0h 55m 9s
//! ```
//!
//! The extractor finds `Processando <processed>/<found>` anywhere in the text.

use std::sync::OnceLock;

use regex::Regex;

use crate::events::{Event, EventType};

const PROGRESS_PATTERN: &str = r"Processando ([0-9]+)/([0-9]+)";

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PROGRESS_PATTERN).expect("progress pattern is valid"))
}

/// Item counts reported by one progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Items processed so far.
    pub processed: u64,
    /// Items discovered so far.
    pub found: u64,
}

impl Progress {
    /// Parses the first `Processando P/F` occurrence in `text`.
    ///
    /// Counts that do not fit in a `u64` are treated as no match.
    pub fn parse(text: &str) -> Option<Self> {
        let captures = progress_regex().captures(text)?;
        let processed = captures.get(1)?.as_str().parse().ok()?;
        let found = captures.get(2)?.as_str().parse().ok()?;
        Some(Self { processed, found })
    }

    /// Extracts progress from an event; only `progress` events are examined.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.event_type != EventType::Progress {
            return None;
        }
        Self::parse(event.progress_text()?)
    }
}

/// Tuple form of [`Progress::from_event`]: `(processed, found, matched)`,
/// zeroes when nothing matched.
pub fn extract(event: &Event) -> (u64, u64, bool) {
    match Progress::from_event(event) {
        Some(p) => (p.processed, p.found, true),
        None => (0, 0, false),
    }
}
