//! Normalized include rule (spec §4.6 "BuildInclude normalization").
//!
//! Grounded on the teacher's `resolver`-adjacent path-matching helpers for
//! the "glob plus regex, excludes checked first" shape; globset/regex are
//! the same crates the teacher already depends on for path filtering.

use std::collections::HashMap;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde_json::Value;

use crate::error::Result;
use crate::project_config::{HandlerDescriptor, IncludeRule};

pub struct BuildInclude {
    match_globs: Option<GlobSet>,
    patterns: Vec<Regex>,
    exclude_globs: Option<GlobSet>,
    pub handlers: Vec<HandlerDescriptor>,
    pub options: HashMap<String, Value>,
    pub build: bool,
}

impl BuildInclude {
    pub fn from_rule(rule: &IncludeRule) -> Result<Self> {
        let match_globs = build_glob_set(rule.r#match.as_ref().map(|m| m.as_vec()))?;
        let exclude_globs = build_glob_set(rule.exclude.as_ref().map(|m| m.as_vec()))?;
        let patterns = rule
            .pattern
            .as_ref()
            .map(|p| p.as_vec())
            .unwrap_or_default()
            .iter()
            .map(|p| Regex::new(p).map_err(Into::into))
            .collect::<Result<Vec<Regex>>>()?;
        let handlers = rule
            .handlers
            .iter()
            .map(HandlerDescriptor::from_file_spec)
            .collect::<Result<Vec<HandlerDescriptor>>>()?;

        Ok(Self {
            match_globs,
            patterns,
            exclude_globs,
            handlers,
            options: rule.options.clone(),
            build: rule.build,
        })
    }

    /// Excludes are checked first; then true if any `match` glob or any
    /// `pattern` regex matches (spec §4.6 `doesInclude`).
    pub fn does_include(&self, candidate: &Path) -> bool {
        if let Some(exclude) = &self.exclude_globs {
            if exclude.is_match(candidate) {
                return false;
            }
        }

        let match_hit = self.match_globs.as_ref().is_some_and(|g| g.is_match(candidate));
        if match_hit {
            return true;
        }

        let candidate_str = candidate.to_string_lossy();
        self.patterns.iter().any(|re| re.is_match(&candidate_str))
    }
}

fn build_glob_set(patterns: Option<Vec<String>>) -> Result<Option<GlobSet>> {
    let Some(patterns) = patterns else { return Ok(None) };
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(&pattern)?);
    }
    Ok(Some(builder.build()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_config::MatchList;

    fn rule(r#match: Option<&str>, pattern: Option<&str>, exclude: Option<&str>) -> IncludeRule {
        IncludeRule {
            r#match: r#match.map(|s| MatchList::One(s.to_string())),
            pattern: pattern.map(|s| MatchList::One(s.to_string())),
            exclude: exclude.map(|s| MatchList::One(s.to_string())),
            handlers: Vec::new(),
            options: HashMap::new(),
            build: true,
        }
    }

    #[test]
    fn exclude_takes_precedence_over_match() {
        let include = BuildInclude::from_rule(&rule(Some("src/*.js"), None, Some("src/skip.js"))).unwrap();
        assert!(include.does_include(Path::new("src/a.js")));
        assert!(!include.does_include(Path::new("src/skip.js")));
    }

    #[test]
    fn pattern_matches_as_substring_regex() {
        let include = BuildInclude::from_rule(&rule(None, Some(r"^src/.*\.js$"), None)).unwrap();
        assert!(include.does_include(Path::new("src/a.js")));
        assert!(!include.does_include(Path::new("src/a.css")));
    }

    #[test]
    fn no_match_or_pattern_never_includes() {
        let include = BuildInclude::from_rule(&rule(None, None, None)).unwrap();
        assert!(!include.does_include(Path::new("src/a.js")));
    }
}
