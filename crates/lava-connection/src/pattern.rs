use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

/// Something `expect` can wait for.
#[derive(Debug, Clone)]
pub enum Pattern {
  /// Exact text.
  Literal(String),
  /// Regular expression; capture groups are reported in the match.
  Regex(Regex),
  /// Matches when the stream is closed.
  Eof,
  /// Matches when the wait times out.
  Timeout,
}

impl Pattern {
  pub fn literal(text: impl Into<String>) -> Self {
    Pattern::Literal(text.into())
  }

  pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
    Regex::new(pattern).map(Pattern::Regex)
  }

  pub fn is_eof(&self) -> bool {
    matches!(self, Pattern::Eof)
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, Pattern::Timeout)
  }

  /// Byte length of a literal, the longest text it can need to look back
  /// over.
  pub(crate) fn literal_len(&self) -> usize {
    match self {
      Pattern::Literal(text) => text.len(),
      _ => 0,
    }
  }

  /// First match starting at or after `from`, which must be a char
  /// boundary of `haystack`.
  fn find(&self, haystack: &str, from: usize) -> Option<Found> {
    match self {
      Pattern::Literal(text) if text.is_empty() => None,
      Pattern::Literal(text) => haystack[from..].find(text.as_str()).map(|offset| Found {
        start: from + offset,
        end: from + offset + text.len(),
        groups: Vec::new(),
        named: BTreeMap::new(),
      }),
      Pattern::Regex(re) => {
        let caps = re.captures_at(haystack, from)?;
        let whole = caps.get(0)?;
        let groups = caps
          .iter()
          .skip(1)
          .map(|g| g.map(|m| m.as_str().to_string()))
          .collect();
        let named = re
          .capture_names()
          .flatten()
          .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
          .collect();
        Some(Found {
          start: whole.start(),
          end: whole.end(),
          groups,
          named,
        })
      }
      Pattern::Eof | Pattern::Timeout => None,
    }
  }
}

impl fmt::Display for Pattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Pattern::Literal(text) => write!(f, "{text:?}"),
      Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
      Pattern::Eof => f.write_str("EOF"),
      Pattern::Timeout => f.write_str("TIMEOUT"),
    }
  }
}

impl From<&str> for Pattern {
  fn from(text: &str) -> Self {
    Pattern::literal(text)
  }
}

/// Result of a successful `expect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
  /// Index of the pattern that matched.
  pub index: usize,
  /// Text consumed before the match.
  pub before: String,
  /// The matched text, empty for the EOF and TIMEOUT sentinels.
  pub matched: String,
  /// Positional capture groups, group 1 first.
  pub groups: Vec<Option<String>>,
  /// Named capture groups that participated in the match.
  pub named: BTreeMap<String, String>,
}

impl ExpectMatch {
  pub(crate) fn sentinel(index: usize, before: String) -> Self {
    Self {
      index,
      before,
      matched: String::new(),
      groups: Vec::new(),
      named: BTreeMap::new(),
    }
  }

  /// Positional group, 1-based.
  pub fn group(&self, n: usize) -> Option<&str> {
    n.checked_sub(1)
      .and_then(|i| self.groups.get(i))
      .and_then(|g| g.as_deref())
  }

  pub fn name(&self, name: &str) -> Option<&str> {
    self.named.get(name).map(String::as_str)
  }
}

#[derive(Debug)]
pub(crate) struct Found {
  pub start: usize,
  pub end: usize,
  pub groups: Vec<Option<String>>,
  pub named: BTreeMap<String, String>,
}

/// Earliest match of any pattern in `haystack` at or after `from`; ties go
/// to the lowest index.
pub(crate) fn earliest_match(
  patterns: &[Pattern],
  haystack: &str,
  from: usize,
) -> Option<(usize, Found)> {
  patterns
    .iter()
    .enumerate()
    .filter_map(|(index, pattern)| pattern.find(haystack, from).map(|found| (index, found)))
    .min_by_key(|(index, found)| (found.start, *index))
}

/// Human readable list of patterns for error messages.
pub(crate) fn describe(patterns: &[Pattern]) -> String {
  patterns
    .iter()
    .filter(|p| !p.is_eof() && !p.is_timeout())
    .map(ToString::to_string)
    .collect::<Vec<_>>()
    .join(" | ")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_earliest_match_wins() {
    let patterns = vec![Pattern::literal("login:"), Pattern::literal("Password")];
    let (index, found) = earliest_match(&patterns, "Password: ... login:", 0).unwrap();
    assert_eq!(index, 1);
    assert_eq!(found.start, 0);
  }

  #[test]
  fn test_tie_goes_to_lowest_index() {
    let patterns = vec![Pattern::literal("root@"), Pattern::regex(r"root@\w+").unwrap()];
    let (index, _) = earliest_match(&patterns, "root@debian:~#", 0).unwrap();
    assert_eq!(index, 0);
  }

  #[test]
  fn test_regex_groups() {
    let patterns = vec![Pattern::regex(r"<LAVA_SIGNAL_(\S+) ([^>]+)>").unwrap()];
    let (_, found) = earliest_match(&patterns, "noise <LAVA_SIGNAL_STARTRUN 0_smoke smoke>\n", 0).unwrap();
    assert_eq!(found.groups[0].as_deref(), Some("STARTRUN"));
    assert_eq!(found.groups[1].as_deref(), Some("0_smoke smoke"));
  }

  #[test]
  fn test_sentinels_never_match_text() {
    let patterns = vec![Pattern::Eof, Pattern::Timeout, Pattern::literal("")];
    assert!(earliest_match(&patterns, "EOF TIMEOUT", 0).is_none());
    assert_eq!(describe(&[Pattern::literal("a"), Pattern::Eof]), "\"a\"");
  }

  #[test]
  fn test_search_from_offset() {
    let patterns = vec![Pattern::literal("root@"), Pattern::regex(r"\broot\b").unwrap()];
    let haystack = "root@old ... root@new";
    let (index, found) = earliest_match(&patterns, haystack, 1).unwrap();
    assert_eq!(index, 0);
    assert_eq!(found.start, 13);
    // Regex context before the offset still counts.
    assert!(earliest_match(&patterns[1..], "xroot", 1).is_none());
  }
}
