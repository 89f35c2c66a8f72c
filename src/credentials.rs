//! Round-robin selection over caller-supplied credentials.
//!
//! Callers may pack several upstream tokens into one bearer value, separated
//! by commas. Each chat request uses the next token in turn; the cursor is
//! shared by every request the process serves.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Ordered secrets parsed from a single comma-delimited credential string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSet {
    parts: Vec<String>,
}

impl CredentialSet {
    /// Split on commas and trim each part. Blank parts are dropped.
    pub fn parse(raw: &str) -> Self {
        let parts = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { parts }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.parts.get(index).map(String::as_str)
    }
}

/// The secret chosen for one upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub secret: String,
    /// Position within the set, or `None` when the raw input was passed through.
    pub index: Option<usize>,
}

/// Process-wide round-robin cursor.
#[derive(Debug, Default)]
pub struct Rotator {
    cursor: AtomicUsize,
}

impl Rotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the credential under the cursor and advance it.
    ///
    /// The cursor is stored modulo the size of the set it was last advanced
    /// against, so alternating callers with differently sized sets still see
    /// an in-range index.
    pub fn select(&self, raw: &str) -> Selection {
        let set = CredentialSet::parse(raw);
        if set.is_empty() {
            return passthrough(raw);
        }

        let len = set.len();
        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
            .unwrap_or_else(|c| c);
        let index = previous % len;

        Selection {
            secret: set.parts[index].clone(),
            index: Some(index),
        }
    }

    /// Pick a specific credential without touching the cursor.
    /// Out-of-range indices fall back to the first credential.
    pub fn select_at(&self, raw: &str, index: usize) -> Selection {
        let set = CredentialSet::parse(raw);
        match set.get(index) {
            Some(secret) => Selection {
                secret: secret.to_string(),
                index: Some(index),
            },
            None => match set.get(0) {
                Some(first) => Selection {
                    secret: first.to_string(),
                    index: Some(0),
                },
                None => passthrough(raw),
            },
        }
    }

    #[cfg(test)]
    fn position(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }
}

fn passthrough(raw: &str) -> Selection {
    Selection {
        secret: raw.trim().to_string(),
        index: None,
    }
}
