use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use rustc_hash::FxHashSet;
use tracing::debug;

/// Compiled Adblock-Plus-style domain rules (the gfwlist dialect):
/// `||domain` anchored suffix, `|http://...` URL prefix, plain keyword,
/// `/regex/`, with `@@` marking exceptions and `!`/`[` comments.
#[derive(Debug, Default)]
pub struct DomainMatcher {
    suffixes: FxHashSet<String>,
    keywords: Vec<String>,
    regexes: Vec<Regex>,
    excluded_suffixes: FxHashSet<String>,
    excluded_keywords: Vec<String>,
}

impl DomainMatcher {
    pub fn from_text(text: &str) -> Self {
        let mut m = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('!') || line.starts_with('[') {
                continue;
            }
            let (line, excluded) = match line.strip_prefix("@@") {
                Some(rest) => (rest, true),
                None => (line, false),
            };
            if let Some(rest) = line.strip_prefix("||") {
                let domain = normalize_domain(rest);
                if domain.is_empty() {
                    continue;
                }
                if excluded {
                    m.excluded_suffixes.insert(domain);
                } else {
                    m.suffixes.insert(domain);
                }
            } else if let Some(rest) = line.strip_prefix('|') {
                // |http://host/... anchors on the host part
                let host = rest
                    .trim_start_matches("http://")
                    .trim_start_matches("https://");
                let domain = normalize_domain(host.split('/').next().unwrap_or(""));
                if domain.is_empty() {
                    continue;
                }
                if excluded {
                    m.excluded_suffixes.insert(domain);
                } else {
                    m.suffixes.insert(domain);
                }
            } else if line.starts_with('/') && line.ends_with('/') && line.len() > 2 {
                match Regex::new(&line[1..line.len() - 1]) {
                    Ok(re) => m.regexes.push(re),
                    Err(err) => debug!(rule = %line, error = %err, "invalid regex rule"),
                }
            } else {
                let keyword = normalize_domain(line);
                if keyword.is_empty() {
                    continue;
                }
                if excluded {
                    m.excluded_keywords.push(keyword);
                } else {
                    m.keywords.push(keyword);
                }
            }
        }
        m
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read rule file: {}", path.display()))?;
        Ok(Self::from_text(&raw))
    }

    /// `Some(true)` on a match, `Some(false)` on an exception rule,
    /// `None` when no rule has an opinion.
    pub fn matches(&self, name: &str) -> Option<bool> {
        let name = normalize_domain(name);
        if name.is_empty() {
            return None;
        }
        if self.suffix_hit(&self.excluded_suffixes, &name)
            || self
                .excluded_keywords
                .iter()
                .any(|k| name.contains(k.as_str()))
        {
            return Some(false);
        }
        if self.suffix_hit(&self.suffixes, &name)
            || self.keywords.iter().any(|k| name.contains(k.as_str()))
            || self.regexes.iter().any(|re| re.is_match(&name))
        {
            return Some(true);
        }
        None
    }

    // Walk the name label by label so "a.b.example.com" hits a
    // "||example.com" rule without scanning every stored suffix.
    fn suffix_hit(&self, set: &FxHashSet<String>, name: &str) -> bool {
        let mut search = name;
        loop {
            if set.contains(search) {
                return true;
            }
            match search.find('.') {
                Some(idx) => search = &search[idx + 1..],
                None => return false,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
            && self.keywords.is_empty()
            && self.regexes.is_empty()
            && self.excluded_suffixes.is_empty()
            && self.excluded_keywords.is_empty()
    }

    /// Merge another rule set into this one.
    pub fn extend(&mut self, other: DomainMatcher) {
        self.suffixes.extend(other.suffixes);
        self.keywords.extend(other.keywords);
        self.regexes.extend(other.regexes);
        self.excluded_suffixes.extend(other.excluded_suffixes);
        self.excluded_keywords.extend(other.excluded_keywords);
    }
}

fn normalize_domain(s: &str) -> String {
    s.trim()
        .trim_start_matches('.')
        .trim_end_matches('/')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchored_suffix_rules() {
        let m = DomainMatcher::from_text("||example.com\n");
        assert_eq!(m.matches("example.com"), Some(true));
        assert_eq!(m.matches("www.example.com"), Some(true));
        assert_eq!(m.matches("www.example.com."), Some(true));
        assert_eq!(m.matches("badexample.com"), None);
    }

    #[test]
    fn exception_rules_win() {
        let m = DomainMatcher::from_text("||example.com\n@@||safe.example.com\n");
        assert_eq!(m.matches("www.example.com"), Some(true));
        assert_eq!(m.matches("safe.example.com"), Some(false));
        assert_eq!(m.matches("a.safe.example.com"), Some(false));
    }

    #[test]
    fn keyword_and_url_prefix_rules() {
        let m = DomainMatcher::from_text("blocked-word\n|http://tracker.example.org/path\n");
        assert_eq!(m.matches("some.blocked-word.net"), Some(true));
        assert_eq!(m.matches("tracker.example.org"), Some(true));
        assert_eq!(m.matches("clean.example.org"), None);
    }

    #[test]
    fn regex_rules() {
        let m = DomainMatcher::from_text("/^ads[0-9]+\\./\n");
        assert_eq!(m.matches("ads12.example.com"), Some(true));
        assert_eq!(m.matches("ads.example.com"), None);
    }

    #[test]
    fn comments_and_headers_are_ignored() {
        let m = DomainMatcher::from_text("! comment\n[AutoProxy 0.2.9]\n\n");
        assert!(m.is_empty());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let m = DomainMatcher::from_text("||Example.COM\n");
        assert_eq!(m.matches("WWW.EXAMPLE.com"), Some(true));
    }

    #[test]
    fn extend_merges_rule_sets() {
        let mut base = DomainMatcher::from_text("||one.test\n");
        base.extend(DomainMatcher::from_text("||two.test\n"));
        assert_eq!(base.matches("one.test"), Some(true));
        assert_eq!(base.matches("a.two.test"), Some(true));
    }
}
