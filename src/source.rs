// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry sources and the set of sources a server may hand out.
//!
//! A source is a partition of the registry with its own serial and version
//! numbering. A server is configured with one authoritative source and,
//! optionally, its non-authoritative counterpart (e.g. `RIPE` and
//! `RIPE-NONAUTH`). Clients name sources case-insensitively; the configured
//! spelling is canonical.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a registry data partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Source(String);

impl Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a client-supplied name.
    pub fn matches(&self, name: &str) -> bool {
        self.0.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Source {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// The sources a connecting client may mirror from this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    authoritative: Source,
    non_authoritative: Option<Source>,
}

impl SourceContext {
    /// Context serving only the authoritative source.
    pub fn new(authoritative: impl Into<Source>) -> Self {
        Self {
            authoritative: authoritative.into(),
            non_authoritative: None,
        }
    }

    /// Also serve the non-authoritative counterpart.
    pub fn with_non_authoritative(mut self, source: impl Into<Source>) -> Self {
        self.non_authoritative = Some(source.into());
        self
    }

    pub fn authoritative(&self) -> &Source {
        &self.authoritative
    }

    pub fn non_authoritative(&self) -> Option<&Source> {
        self.non_authoritative.as_ref()
    }

    /// Resolve a client-supplied source name to the canonical servable source.
    ///
    /// Returns `None` when the name matches neither configured source.
    pub fn resolve(&self, requested: &str) -> Option<&Source> {
        self.servable().find(|source| source.matches(requested))
    }

    /// All sources this context serves, authoritative first.
    pub fn servable(&self) -> impl Iterator<Item = &Source> {
        std::iter::once(&self.authoritative).chain(self.non_authoritative.iter())
    }
}

impl From<String> for Source {
    fn from(name: String) -> Self {
        Self(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_matches_case_insensitive() {
        let source = Source::new("RIPE");
        assert!(source.matches("ripe"));
        assert!(source.matches("RiPe"));
        assert!(!source.matches("RIPE-NONAUTH"));
    }

    #[test]
    fn test_resolve_authoritative_only() {
        let ctx = SourceContext::new("RIPE");
        assert_eq!(ctx.resolve("ripe"), Some(&Source::new("RIPE")));
        assert_eq!(ctx.resolve("RIPE-NONAUTH"), None);
        assert_eq!(ctx.resolve("FOO"), None);
    }

    #[test]
    fn test_resolve_with_non_authoritative() {
        let ctx = SourceContext::new("RIPE").with_non_authoritative("RIPE-NONAUTH");
        assert_eq!(ctx.resolve("ripe-nonauth"), Some(&Source::new("RIPE-NONAUTH")));
        assert_eq!(ctx.resolve("RIPE"), Some(&Source::new("RIPE")));
        assert_eq!(ctx.servable().count(), 2);
    }

    #[test]
    fn test_source_serializes_as_plain_string() {
        let json = serde_json::to_string(&Source::new("TEST")).unwrap();
        assert_eq!(json, "\"TEST\"");
    }
}
