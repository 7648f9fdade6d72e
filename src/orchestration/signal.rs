//! Completion signal parsing for agent transcripts.
//!
//! Agents end each iteration by emitting one of three tags:
//!
//! - `<continue/>`: more work remains, run another iteration
//! - `<complete/>`: the task is done and ready for review
//! - `<blocked reason="..."/>`: the agent cannot proceed
//!
//! Only the **last** tag in the transcript counts. Agents often quote the
//! protocol back or change their mind mid-run, so earlier tags are logged at
//! debug level and ignored.
//!
//! ## Example
//!
//! ```
//! use lanekeeper::orchestration::signal::{parse, Signal};
//!
//! assert_eq!(parse("all tests pass\n<complete/>"), Signal::Complete);
//! assert_eq!(
//!     parse(r#"<blocked reason="needs API key"/>"#),
//!     Signal::Blocked("needs API key".to_string())
//! );
//! assert!(parse("no tag here").is_ambiguous());
//! ```

use regex::Regex;
use std::sync::LazyLock;

use crate::llog_debug;
use crate::util::tail_chars;

/// Reason used when a `blocked` tag carries no usable `reason`.
pub const UNSPECIFIED_REASON: &str = "unspecified";

/// Characters of transcript kept in [`Signal::Ambiguous`].
pub const AMBIGUOUS_TAIL_CHARS: usize = 512;

/// Matches `<continue/>`, `<complete>`, `< BLOCKED reason='x' />` and friends.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(continue|complete|blocked)\b([^<>]*?)\s*/?\s*>").unwrap()
});

static REASON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\breason\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// Outcome of one agent iteration as declared by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Complete,
    Blocked(String),
    /// No recognizable tag. Carries the tail of the transcript.
    Ambiguous(String),
}

impl Signal {
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Signal::Ambiguous(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Continue => "continue",
            Signal::Complete => "complete",
            Signal::Blocked(_) => "blocked",
            Signal::Ambiguous(_) => "ambiguous",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Blocked(reason) => write!(f, "blocked({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Extract the authoritative signal from a transcript.
///
/// # Example
///
/// ```
/// use lanekeeper::orchestration::signal::{parse, Signal};
///
/// // The protocol quoted early on does not count, the final tag does.
/// let transcript = "I will print <complete/> when done.\n...\n<continue/>";
/// assert_eq!(parse(transcript), Signal::Continue);
///
/// assert_eq!(parse("<blocked/>"), Signal::Blocked("unspecified".to_string()));
/// ```
pub fn parse(transcript: &str) -> Signal {
    let matches: Vec<regex::Captures<'_>> = TAG_RE.captures_iter(transcript).collect();
    let Some((last, earlier)) = matches.split_last() else {
        return Signal::Ambiguous(tail_chars(transcript, AMBIGUOUS_TAIL_CHARS).to_string());
    };

    for decoy in earlier {
        llog_debug!(
            "Ignoring earlier signal tag: {}",
            decoy.get(0).map(|m| m.as_str()).unwrap_or_default()
        );
    }

    let kind = last
        .get(1)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    match kind.as_str() {
        "continue" => Signal::Continue,
        "complete" => Signal::Complete,
        _ => {
            let attrs = last.get(2).map(|m| m.as_str()).unwrap_or_default();
            Signal::Blocked(blocked_reason(attrs))
        }
    }
}

fn blocked_reason(attrs: &str) -> String {
    let reason = REASON_RE
        .captures(attrs)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| unescape(m.as_str().trim()))
        .unwrap_or_default();
    if reason.is_empty() {
        UNSPECIFIED_REASON.to_string()
    } else {
        reason
    }
}

fn unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
