//! Stream entries and their ordering tokens.

use std::cmp::Ordering;
use std::fmt;

/// Ordering token of a stream entry (`<millis>-<seq>`), or the "latest" marker.
///
/// `Latest` asks the broker for entries strictly newer than whatever is newest at the
/// time of the call; it compares below every concrete id so that the first concrete
/// token always advances the cursor.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamToken {
    Latest,
    Id { millis: u64, seq: u64 },
}

impl StreamToken {
    pub fn id(millis: u64, seq: u64) -> Self {
        StreamToken::Id { millis, seq }
    }

    /// Parse a broker id such as `1700000000000-3` (a bare `millis` means `seq = 0`).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw == "$" {
            return Some(StreamToken::Latest);
        }
        let (millis, seq) = match raw.split_once('-') {
            Some((m, s)) => (m.parse().ok()?, s.parse().ok()?),
            None => (raw.parse().ok()?, 0),
        };
        Some(StreamToken::Id { millis, seq })
    }

    /// Argument form used in read requests.
    pub fn as_arg(&self) -> String {
        self.to_string()
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, StreamToken::Latest)
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamToken::Latest => f.write_str("$"),
            StreamToken::Id { millis, seq } => write!(f, "{millis}-{seq}"),
        }
    }
}

impl PartialOrd for StreamToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamToken {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (StreamToken::Latest, StreamToken::Latest) => Ordering::Equal,
            (StreamToken::Latest, _) => Ordering::Less,
            (_, StreamToken::Latest) => Ordering::Greater,
            (
                StreamToken::Id { millis: a, seq: b },
                StreamToken::Id { millis: c, seq: d },
            ) => (a, b).cmp(&(c, d)),
        }
    }
}

/// One message read from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub token: StreamToken,
    /// Raw PCM bytes; empty when the entry carried no payload field.
    pub payload: Vec<u8>,
}

impl StreamEntry {
    pub fn new(token: StreamToken, payload: Vec<u8>) -> Self {
        Self { token, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_and_bare_ids() {
        assert_eq!(StreamToken::parse("1700000000000-3"), Some(StreamToken::id(1_700_000_000_000, 3)));
        assert_eq!(StreamToken::parse("42"), Some(StreamToken::id(42, 0)));
        assert_eq!(StreamToken::parse("$"), Some(StreamToken::Latest));
        assert_eq!(StreamToken::parse("abc-1"), None);
        assert_eq!(StreamToken::parse("1-"), None);
    }

    #[test]
    fn display_matches_broker_form() {
        assert_eq!(StreamToken::id(5, 1).to_string(), "5-1");
        assert_eq!(StreamToken::Latest.as_arg(), "$");
    }

    #[test]
    fn ordering_is_millis_then_seq() {
        let a = StreamToken::id(1, 9);
        let b = StreamToken::id(2, 0);
        let c = StreamToken::id(2, 1);
        assert!(a < b && b < c);
        assert!(StreamToken::Latest < a);
    }
}
