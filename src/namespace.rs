//! Namespace allow-list and remapping.
//!
//! A namespace is `database.collection`. Patterns may contain a single `*`
//! wildcard (`db.*`, `*.users`, `db.logs_*`). A mapping whose source has a
//! wildcard must have one in its destination too; the text matched by the
//! source wildcard is substituted into the destination.
//!
//! ```
//! use oplog_connector::namespace::NamespaceFilter;
//! use std::collections::HashMap;
//!
//! let mapping = HashMap::from([("app.*".to_string(), "search.app_*".to_string())]);
//! let filter = NamespaceFilter::new(&[], &mapping).unwrap();
//!
//! assert!(filter.is_included("app.users"));
//! assert_eq!(filter.map("app.users"), "search.app_users");
//! assert_eq!(filter.unmap("search.app_users"), "app.users");
//! ```
//!
//! Mapping keys are implicitly included. Namespaces in the `admin`, `config`
//! and `local` databases and `system.*` collections are never replicated.

use crate::error::{ConnectorError, Result};
use std::collections::{HashMap, HashSet};

const INTERNAL_DATABASES: [&str; 3] = ["admin", "config", "local"];

/// A namespace pattern with at most one `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    raw: String,
    /// Prefix/suffix around the wildcard; `None` for exact patterns.
    wildcard: Option<(String, String)>,
}

impl Pattern {
    fn parse(raw: &str) -> Result<Self> {
        if !raw.contains('.') {
            return Err(ConnectorError::Config(format!(
                "namespace {:?} must be of the form database.collection",
                raw
            )));
        }
        let wildcard = match raw.matches('*').count() {
            0 => None,
            1 => {
                let (prefix, suffix) = raw.split_once('*').unwrap_or((raw, ""));
                Some((prefix.to_string(), suffix.to_string()))
            }
            _ => {
                return Err(ConnectorError::Config(format!(
                    "namespace {:?} has more than one wildcard",
                    raw
                )))
            }
        };
        Ok(Self {
            raw: raw.to_string(),
            wildcard,
        })
    }

    /// Match `ns`, returning the text captured by the wildcard (empty for exact).
    fn capture<'a>(&self, ns: &'a str) -> Option<&'a str> {
        match &self.wildcard {
            None => (self.raw == ns).then_some(""),
            Some((prefix, suffix)) => {
                if ns.len() < prefix.len() + suffix.len() {
                    return None;
                }
                ns.strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_suffix(suffix.as_str()))
            }
        }
    }

    fn substitute(&self, captured: &str) -> String {
        match &self.wildcard {
            None => self.raw.clone(),
            Some((prefix, suffix)) => format!("{}{}{}", prefix, captured, suffix),
        }
    }

    /// Anchored regex source for server-side filtering.
    fn to_regex(&self) -> String {
        match &self.wildcard {
            None => escape_regex(&self.raw),
            Some((prefix, suffix)) => format!("{}.*{}", escape_regex(prefix), escape_regex(suffix)),
        }
    }
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Whether a namespace belongs to a database or collection MongoDB manages itself.
pub fn is_internal_namespace(ns: &str) -> bool {
    let (db, coll) = ns.split_once('.').unwrap_or((ns, ""));
    INTERNAL_DATABASES.contains(&db) || coll.starts_with("system.")
}

/// Immutable namespace allow-list plus source→destination mapping.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    include: Vec<Pattern>,
    mapping: Vec<(Pattern, Pattern)>,
}

impl NamespaceFilter {
    /// Build from an allow-list (empty = everything) and a mapping table.
    ///
    /// Rejects malformed patterns, wildcard mismatches between mapping source
    /// and destination, and two sources mapped onto the same destination
    /// (the mapping has to be reversible for rollback lookups).
    pub fn new(include: &[String], mapping: &HashMap<String, String>) -> Result<Self> {
        let mut patterns = include
            .iter()
            .map(|raw| Pattern::parse(raw))
            .collect::<Result<Vec<_>>>()?;

        // Sorted for deterministic first-match behaviour.
        let mut pairs: Vec<(&String, &String)> = mapping.iter().collect();
        pairs.sort();

        let mut seen_destinations = HashSet::new();
        let mut mapped = Vec::with_capacity(pairs.len());
        for (src, dst) in pairs {
            let src_pattern = Pattern::parse(src)?;
            let dst_pattern = Pattern::parse(dst)?;
            if src_pattern.wildcard.is_some() != dst_pattern.wildcard.is_some() {
                return Err(ConnectorError::Config(format!(
                    "mapping {:?} -> {:?}: wildcard must appear on both sides or neither",
                    src, dst
                )));
            }
            if !seen_destinations.insert(dst.clone()) {
                return Err(ConnectorError::Config(format!(
                    "destination namespace {:?} is mapped from more than one source",
                    dst
                )));
            }
            if !include.is_empty() && !patterns.iter().any(|p| p.raw == src_pattern.raw) {
                patterns.push(src_pattern.clone());
            }
            mapped.push((src_pattern, dst_pattern));
        }

        Ok(Self {
            include: patterns,
            mapping: mapped,
        })
    }

    /// Whether entries for `ns` should be replicated.
    pub fn is_included(&self, ns: &str) -> bool {
        if is_internal_namespace(ns) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.capture(ns).is_some())
    }

    /// Whether an allow-list is configured.
    pub fn has_allow_list(&self) -> bool {
        !self.include.is_empty()
    }

    /// Destination namespace for a source namespace.
    pub fn map(&self, ns: &str) -> String {
        for (src, dst) in &self.mapping {
            if let Some(captured) = src.capture(ns) {
                return dst.substitute(captured);
            }
        }
        ns.to_string()
    }

    /// Source namespace for a destination namespace; inverse of [`map`](Self::map).
    pub fn unmap(&self, ns: &str) -> String {
        for (src, dst) in &self.mapping {
            if let Some(captured) = dst.capture(ns) {
                return src.substitute(captured);
            }
        }
        ns.to_string()
    }

    /// Anchored regex matching every allowed namespace, for server-side
    /// oplog filtering. `None` when there is no allow-list.
    pub fn to_regex(&self) -> Option<String> {
        if self.include.is_empty() {
            return None;
        }
        let alternatives: Vec<String> = self.include.iter().map(Pattern::to_regex).collect();
        Some(format!("^(?:{})$", alternatives.join("|")))
    }
}
