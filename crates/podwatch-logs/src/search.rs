use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};

use podwatch_types::{LogLine, SearchOptions, SearchResult};

use crate::buffer::LogBuffer;
use crate::error::{Result, WatchError};

/// A search pattern compiled against a set of options
#[derive(Clone)]
pub struct CompiledQuery {
    matcher: Matcher,

    /// Original pattern string
    pattern: String,

    /// Keep only the newest N matches
    limit: Option<usize>,

    /// Skip lines stamped before this instant
    since: Option<DateTime<Utc>>,
}

#[derive(Clone)]
enum Matcher {
    /// Matches nothing (empty pattern)
    Nothing,
    /// Case-sensitive literal substring
    Literal(String),
    /// Regex, or a case-insensitive literal compiled to one
    Regex(Regex),
}

impl CompiledQuery {
    /// Compile a pattern. An empty pattern matches nothing.
    pub fn new(pattern: &str, options: &SearchOptions) -> Result<Self> {
        let matcher = if pattern.is_empty() {
            Matcher::Nothing
        } else if !options.use_regex && options.case_sensitive {
            Matcher::Literal(pattern.to_string())
        } else {
            let source = if options.use_regex {
                pattern.to_string()
            } else {
                regex::escape(pattern)
            };
            Matcher::Regex(
                RegexBuilder::new(&source)
                    .case_insensitive(!options.case_sensitive)
                    .build()?,
            )
        };

        Ok(Self {
            matcher,
            pattern: pattern.to_string(),
            limit: options.max_matches(),
            since: options.since,
        })
    }

    /// Check if a line matches
    pub fn matches(&self, line: &str) -> bool {
        match &self.matcher {
            Matcher::Nothing => false,
            Matcher::Literal(needle) => line.contains(needle.as_str()),
            Matcher::Regex(re) => re.is_match(line),
        }
    }

    /// Whether a buffered line passes both the time window and the pattern
    fn accepts(&self, line: &LogLine) -> bool {
        if let Some(since) = self.since {
            if line.timestamp.is_none_or(|ts| ts < since) {
                return false;
            }
        }
        self.matches(&line.message)
    }

    /// Matching messages in input order, trimmed to the newest `limit`
    pub fn filter<'a, I>(&self, lines: I) -> Vec<String>
    where
        I: DoubleEndedIterator<Item = &'a LogLine>,
    {
        let Some(limit) = self.limit else {
            return lines
                .filter(|l| self.accepts(l))
                .map(|l| l.message.clone())
                .collect();
        };

        // Walk newest to oldest so only `limit` lines are ever copied
        let mut newest: Vec<String> = lines
            .rev()
            .filter(|l| self.accepts(l))
            .take(limit)
            .map(|l| l.message.clone())
            .collect();
        newest.reverse();
        newest
    }

    /// Whether this query can never match
    pub fn is_empty(&self) -> bool {
        matches!(self.matcher, Matcher::Nothing)
    }
}

impl std::fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("pattern", &self.pattern)
            .field("limit", &self.limit)
            .field("since", &self.since)
            .finish()
    }
}

/// Linear-scan search over buffered pod history
#[derive(Clone)]
pub struct SearchIndex {
    buffer: LogBuffer,
}

impl SearchIndex {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }

    /// Search one pod's buffered lines
    pub fn search(&self, pod: &str, pattern: &str, options: &SearchOptions) -> Result<SearchResult> {
        let ring = self
            .buffer
            .ring(pod)
            .ok_or_else(|| WatchError::NotFound(pod.to_string()))?;
        let query = CompiledQuery::new(pattern, options)?;

        if query.is_empty() {
            return Ok(SearchResult::new(pod, Vec::new()));
        }

        let snapshot = ring.snapshot();
        let matches = query.filter(snapshot.iter());
        tracing::debug!(pod, pattern, matches = matches.len(), "searched buffered lines");

        Ok(SearchResult::new(pod, matches))
    }

    /// Search every watched pod; only pods with matches are returned, ordered by name
    pub fn search_all(&self, pattern: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        let query = CompiledQuery::new(pattern, options)?;
        if query.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self
            .buffer
            .snapshot_all()
            .into_iter()
            .map(|(pod, lines)| {
                let matches = query.filter(lines.iter());
                SearchResult::new(pod, matches)
            })
            .filter(|r| !r.is_empty())
            .collect())
    }
}
