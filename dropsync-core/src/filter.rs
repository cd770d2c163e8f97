use crate::config::Pattern;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

/// Runtime filter compiled from include / exclude pattern lists.
///
/// Patterns match store-relative paths (`a/b/c.txt`). Include patterns select files only;
/// directories are kept unless excluded so that included files beneath them stay reachable.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl Default for PathFilter {
    fn default() -> Self {
        Self {
            include: GlobSet::empty(),
            exclude: GlobSet::empty(),
        }
    }
}

impl PathFilter {
    /// Build a filter from lists. Empty include list means "include all".
    pub fn new(include: &[Pattern], exclude: &[Pattern]) -> Self {
        Self {
            include: compile(include),
            exclude: compile(exclude),
        }
    }

    /// Whether a file at `path` should be synced.
    pub fn check(&self, path: &str) -> bool {
        let included = self.include.is_empty() || self.include.is_match(path);
        included && !self.exclude.is_match(path)
    }

    /// Whether a directory at `path` should be synced.
    pub fn allows_dir(&self, path: &str) -> bool {
        !self.exclude.is_match(path)
    }

    pub fn allows(&self, path: &str, is_dir: bool) -> bool {
        if is_dir {
            self.allows_dir(path)
        } else {
            self.check(path)
        }
    }
}

fn compile(patterns: &[Pattern]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        match Glob::new(&pat.0) {
            Ok(g) => {
                builder.add(g);
            }
            Err(e) => warn!(pattern = %pat.0, error = %e, "ignoring invalid glob"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "glob set failed to compile, matching nothing");
        GlobSet::empty()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_basic() {
        let include = vec![Pattern("**/*.rs".into())];
        let exclude = vec![Pattern("tests/**".into())];
        let filter = PathFilter::new(&include, &exclude);
        assert!(filter.check("src/lib.rs"));
        assert!(!filter.check("tests/main.rs"));
        assert!(!filter.check("README.md"));
        assert!(filter.allows_dir("src"));
        assert!(!filter.allows_dir("tests/fixtures"));
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let filter = PathFilter::new(&[], &[Pattern("a[".into()), Pattern("*.tmp".into())]);
        assert!(filter.check("notes.txt"));
        assert!(!filter.check("x.tmp"));
    }
}
