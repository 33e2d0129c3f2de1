//! Path globs for policy patterns.
//!
//! `**` matches any depth (including `/`), `*` matches within one segment.
//! Everything else is literal. Matching is case-insensitive and anchored to
//! the whole path.

use regex::{Regex, RegexBuilder};

/// Backslashes to `/`, surrounding whitespace removed, `.` and empty
/// segments dropped. `./src//a.ts` and `src/a.ts` are the same path.
pub fn normalize_policy_path(path: &str) -> String {
    path.replace('\\', "/")
        .trim()
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Option<Self> {
        let norm = normalize_policy_path(pattern);
        if norm.is_empty() {
            return None;
        }
        let body = norm
            .split("**")
            .map(|part| {
                part.split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join("[^/]*")
            })
            .collect::<Vec<_>>()
            .join(".*");
        let regex = RegexBuilder::new(&format!("^{body}$"))
            .case_insensitive(true)
            .build()
            .ok()?;
        Some(Self {
            pattern: norm,
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Compiled set of globs. An empty set matches nothing.
#[derive(Debug, Clone, Default)]
pub struct GlobSet {
    globs: Vec<Glob>,
}

impl GlobSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            globs: patterns.iter().filter_map(|p| Glob::new(p.as_ref())).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty()
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.globs.iter().any(|g| g.is_match(path))
    }

    pub fn matches_any<S: AsRef<str>>(&self, paths: &[S]) -> bool {
        paths.iter().any(|p| self.is_match(p.as_ref()))
    }
}
