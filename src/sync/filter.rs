//! Tag filtering
//!
//! Allow/deny regex filtering for repository tags. Patterns match the
//! whole tag (anchored as `^pattern$`); allow is applied before deny
//! and the input order is preserved.

use regex::Regex;

use crate::sync::{Result, SyncError};

/// Compiled tag filter
#[derive(Debug, Default)]
pub struct TagFilter {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl TagFilter {
    pub fn new(allow: &[String], deny: &[String]) -> Result<Self> {
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    /// A tag is kept iff allow is empty or any allow matches, and no
    /// deny matches
    pub fn keep(&self, tag: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|re| re.is_match(tag));
        allowed && !self.deny.iter().any(|re| re.is_match(tag))
    }

    /// Filter a tag list, preserving input order
    pub fn filter(&self, tags: Vec<String>) -> Vec<String> {
        tags.into_iter().filter(|t| self.keep(t)).collect()
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^{}$", p))
                .map_err(|e| SyncError::Config(format!("bad tag pattern {:?}: {}", p, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_allows_everything() {
        let filter = TagFilter::new(&[], &[]).unwrap();
        let tags = strings(&["v1", "v2", "latest"]);
        assert_eq!(filter.filter(tags.clone()), tags);
    }

    #[test]
    fn test_allow_then_deny() {
        let filter = TagFilter::new(
            &strings(&["v1.*", "latest"]),
            &strings(&["v1.0-rc.*"]),
        )
        .unwrap();
        let tags = strings(&["v1.0", "v1.0-rc.1", "v2.0", "latest", "dev"]);
        assert_eq!(filter.filter(tags), strings(&["v1.0", "latest"]));
    }

    #[test]
    fn test_patterns_are_anchored() {
        let filter = TagFilter::new(&strings(&["v1"]), &[]).unwrap();
        assert!(filter.keep("v1"));
        assert!(!filter.keep("v1.0"));
        assert!(!filter.keep("xv1"));
    }

    #[test]
    fn test_order_preserved() {
        let filter = TagFilter::new(&strings(&["b", "a", "c"]), &[]).unwrap();
        // output follows the input list, not the allow pattern order
        assert_eq!(filter.filter(strings(&["c", "a", "b"])), strings(&["c", "a", "b"]));
    }

    #[test]
    fn test_idempotent() {
        let filter = TagFilter::new(&strings(&["v.*"]), &strings(&["v0.*"])).unwrap();
        let once = filter.filter(strings(&["v1", "v0.1", "x1"]));
        let twice = filter.filter(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_deny_is_monotone() {
        let base = TagFilter::new(&[], &strings(&["beta.*"])).unwrap();
        let more = TagFilter::new(&[], &strings(&["beta.*", "v2"])).unwrap();
        let tags = strings(&["v1", "v2", "beta.1"]);
        let base_out = base.filter(tags.clone());
        let more_out = more.filter(tags);
        // adding a deny pattern never enlarges the output
        assert!(more_out.iter().all(|t| base_out.contains(t)));
        assert!(more_out.len() <= base_out.len());
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        assert!(TagFilter::new(&strings(&["("]), &[]).is_err());
    }
}
