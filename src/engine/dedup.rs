//! Target identity and staging-area naming
//!
//! [`DedupIndex`] answers "is this key already being worked on / already
//! accepted?". [`ResolvedUrls`] answers "which file does this URL go to?".
//! They are kept apart so neither structure carries two invariants.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use url::Url;

/// Normalized identity of a fetch target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Key for an arbitrary lookup (e.g. `search:collection:query:cursor`)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key for a URL: scheme and host lowercased, default port and fragment
    /// dropped.
    pub fn for_url(raw: &str) -> Result<Self, url::ParseError> {
        let mut url = Url::parse(raw.trim())?;
        url.set_fragment(None);
        Ok(Self(url.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Active,
    Accepted,
}

/// At-most-one bookkeeping per canonical key
#[derive(Debug, Default)]
pub struct DedupIndex {
    slots: HashMap<CanonicalKey, SlotState>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as being worked on. Returns `false` when the key is
    /// already active or accepted.
    pub fn claim(&mut self, key: &CanonicalKey) -> bool {
        if self.slots.contains_key(key) {
            return false;
        }
        self.slots.insert(key.clone(), SlotState::Active);
        true
    }

    /// Record the single accepted result for `key`. Returns `false` if a
    /// result was already accepted.
    pub fn accept(&mut self, key: &CanonicalKey) -> bool {
        match self.slots.get(key) {
            Some(SlotState::Accepted) => false,
            _ => {
                self.slots.insert(key.clone(), SlotState::Accepted);
                true
            }
        }
    }

    /// Forget an active key so it may be claimed again
    pub fn release(&mut self, key: &CanonicalKey) {
        if self.slots.get(key) == Some(&SlotState::Active) {
            self.slots.remove(key);
        }
    }

    pub fn is_active(&self, key: &CanonicalKey) -> bool {
        self.slots.get(key) == Some(&SlotState::Active)
    }

    pub fn is_accepted(&self, key: &CanonicalKey) -> bool {
        self.slots.get(key) == Some(&SlotState::Accepted)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A lookup resolved to a concrete, retrievable URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    /// Key of the lookup that produced this URL
    pub search_key: CanonicalKey,
    /// Key of the retrievable URL itself
    pub key: CanonicalKey,
    pub url: String,
    /// Unique within the staging area
    pub filename: String,
}

/// Insertion-ordered registry of resolved URLs and their filenames
#[derive(Debug, Default)]
pub struct ResolvedUrls {
    entries: Vec<ResolvedUrl>,
    by_key: HashMap<CanonicalKey, usize>,
    filenames: HashSet<String>,
}

impl ResolvedUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `url` as the result of `search_key`. Returns `None` when the
    /// URL was already resolved by another lookup or cannot be parsed.
    pub fn insert(&mut self, search_key: CanonicalKey, url: &str) -> Option<&ResolvedUrl> {
        let key = CanonicalKey::for_url(url).ok()?;
        if self.by_key.contains_key(&key) {
            return None;
        }

        let filename = self.unique_filename(url);
        self.filenames.insert(filename.clone());
        self.by_key.insert(key.clone(), self.entries.len());
        self.entries.push(ResolvedUrl {
            search_key,
            key,
            url: url.to_string(),
            filename,
        });
        self.entries.last()
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<&ResolvedUrl> {
        self.by_key.get(key).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedUrl> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unique_filename(&self, url: &str) -> String {
        let base = url
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .map(sanitize_filename::sanitize)
            .filter(|name| !name.is_empty() && !name.starts_with('.'))
            .unwrap_or_else(|| "file".to_string());

        if !self.filenames.contains(&base) {
            return base;
        }

        let (stem, ext) = match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{}", ext)),
            _ => (base.clone(), String::new()),
        };

        let mut n = 1;
        loop {
            let candidate = format!("{}-{}{}", stem, n, ext);
            if !self.filenames.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}
