use chrono::{DateTime, Utc};

/// Splits the timestamp prefix Kubernetes adds to log lines when
/// `timestamps=true` is requested.
pub struct LineParser;

impl LineParser {
    /// Split a raw line into its timestamp (if any) and content
    pub fn split_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        // K8s timestamp format: 2024-01-15T10:30:00.123456789Z (30 chars)
        // Sometimes shorter: 2024-01-15T10:30:00Z (20 chars)
        if raw.len() < 20 {
            return (None, raw);
        }

        let search_end = Self::floor_char_boundary(raw, 35.min(raw.len()));
        let Some(z_pos) = raw.get(..search_end).and_then(|s| s.find('Z')) else {
            return (None, raw);
        };

        match DateTime::parse_from_rfc3339(&raw[..=z_pos]) {
            Ok(ts) => {
                let rest = &raw[z_pos + 1..];
                // The API separates timestamp and content with a single space
                let rest = rest.strip_prefix(' ').unwrap_or(rest);
                (Some(ts.with_timezone(&Utc)), rest)
            }
            Err(_) => (None, raw),
        }
    }

    /// Find the largest valid char boundary <= the given byte index
    fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
        if idx >= s.len() {
            return s.len();
        }
        while idx > 0 && !s.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }
}
