//! Scope enforcement: which canonical URLs this run is allowed to touch.

use std::collections::HashSet;

use regex::Regex;

use strider_common::config::{ContentConfig, TargetConfig};

use crate::canonical::CanonicalUrl;

/// Compile a `*`-wildcard pattern into an anchored, case-insensitive regex.
/// Every other regex metacharacter is escaped; `*` alone means "anything".
pub fn wildcard_regex(pattern: &str) -> Regex {
    let mut escaped = String::with_capacity(pattern.len() + 8);
    escaped.push_str("(?i)^");
    for c in pattern.chars() {
        if c == '*' {
            escaped.push_str(".*");
        } else {
            escaped.push_str(&regex::escape(&c.to_string()));
        }
    }
    escaped.push('$');
    Regex::new(&escaped).expect("valid regex")
}

/// Why a URL was rejected. Surfaced in skip logs and error tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeReject {
    Domain,
    Extension,
    DisallowedPath,
}

impl ScopeReject {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeReject::Domain => "domain",
            ScopeReject::Extension => "extension",
            ScopeReject::DisallowedPath => "disallowed-path",
        }
    }
}

pub struct ScopeGuard {
    allowed_domains: Vec<String>,
    disallowed_paths: Vec<Regex>,
    exclude_extensions: HashSet<String>,
}

impl ScopeGuard {
    pub fn new(target: &TargetConfig, content: &ContentConfig) -> Self {
        Self {
            allowed_domains: target
                .allowed_domains
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_lowercase())
                .collect(),
            disallowed_paths: target
                .disallowed_paths
                .iter()
                .map(|p| wildcard_regex(p))
                .collect(),
            exclude_extensions: content
                .exclude_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// None when the URL may be fetched; the first failing rule otherwise.
    /// Scheme is already guaranteed http(s) by canonicalization.
    pub fn rejection(&self, url: &CanonicalUrl) -> Option<ScopeReject> {
        if !self.host_allowed(&url.host) {
            return Some(ScopeReject::Domain);
        }
        if let Some(ext) = path_extension(&url.path) {
            if self.exclude_extensions.contains(&ext) {
                return Some(ScopeReject::Extension);
            }
        }
        if self
            .disallowed_paths
            .iter()
            .any(|re| re.is_match(&url.path))
        {
            return Some(ScopeReject::DisallowedPath);
        }
        None
    }

    pub fn allows(&self, url: &CanonicalUrl) -> bool {
        self.rejection(url).is_none()
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_domains
            .iter()
            .any(|d| host == d || host.ends_with(&format!(".{d}")))
    }
}

/// Lowercased extension of the path's final segment, if it has one.
fn path_extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some(ext.to_lowercase())
}
