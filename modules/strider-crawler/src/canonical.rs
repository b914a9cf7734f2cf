//! URL canonicalization: the stable identity every other component keys on.
//!
//! Pure and side-effect free: the same raw input (plus optional base for
//! relative resolution) always yields the same canonical form and url_key.

use regex::Regex;
use url::Url;

/// A normalized URL plus its stable key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUrl {
    pub canonical: String,
    /// Hex sha1 of the canonical form.
    pub url_key: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    /// The raw input carried query parameters matching the drop set
    /// (`utm_*`, `gclid`, ...). The params themselves are gone from the
    /// canonical form; the scheduler reads this as a noise signal.
    pub had_tracking_params: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid url: {0}")]
pub struct InvalidUrl(pub String);

pub struct Canonicalizer {
    drop_params: Vec<Regex>,
    sort_params: bool,
}

impl Canonicalizer {
    /// `drop_params` are wildcard patterns (`utm_*`) for query parameter
    /// names stripped during normalization.
    pub fn new(drop_params: &[String], sort_params: bool) -> Self {
        Self {
            drop_params: drop_params
                .iter()
                .map(|p| crate::scope::wildcard_regex(p))
                .collect(),
            sort_params,
        }
    }

    pub fn canonicalize(
        &self,
        raw: &str,
        base: Option<&Url>,
    ) -> Result<CanonicalUrl, InvalidUrl> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidUrl("empty".to_string()));
        }

        let parsed = match base {
            Some(b) => b.join(trimmed),
            None => Url::parse(trimmed),
        }
        .map_err(|e| InvalidUrl(format!("{trimmed}: {e}")))?;

        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(InvalidUrl(format!("{trimmed}: unsupported scheme {scheme}")));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| InvalidUrl(format!("{trimmed}: missing host")))?
            .to_lowercase();

        // The url crate already resolves dot-segments; duplicate slashes and
        // trailing slashes are ours to normalize.
        let mut path = collapse_slashes(parsed.path());
        if path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        if path.is_empty() {
            path.push('/');
        }
        let path = uppercase_percent_escapes(&path);

        let (query, had_tracking_params) = self.normalize_query(&parsed);

        let mut canonical = format!("{scheme}://{host}");
        if let Some(port) = parsed.port() {
            canonical.push_str(&format!(":{port}"));
        }
        canonical.push_str(&path);
        if let Some(ref q) = query {
            canonical.push('?');
            canonical.push_str(q);
        }

        let url_key = url_key_of(&canonical);

        Ok(CanonicalUrl {
            canonical,
            url_key,
            host,
            path,
            query,
            had_tracking_params,
        })
    }

    /// Normalized query string plus whether any parameter was dropped as
    /// tracking noise.
    fn normalize_query(&self, parsed: &Url) -> (Option<String>, bool) {
        let mut had_tracking_params = false;
        let mut pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(key, _)| {
                if self.drop_params.iter().any(|re| re.is_match(key)) {
                    had_tracking_params = true;
                    false
                } else {
                    true
                }
            })
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if pairs.is_empty() {
            return (None, had_tracking_params);
        }
        if self.sort_params {
            pairs.sort();
        }

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        serializer.extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        (Some(serializer.finish()), had_tracking_params)
    }
}

/// Hex sha1 of a canonical URL string. Exposed so the manifest loader can
/// rebuild the seen-set from stored canonical URLs.
pub fn url_key_of(canonical: &str) -> String {
    use sha1::{Digest, Sha1};
    hex::encode(Sha1::digest(canonical.as_bytes()))
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}

/// Normalize `%xx` escapes to uppercase hex without touching anything else.
fn uppercase_percent_escapes(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            out.push('%');
            out.push(bytes[i + 1].to_ascii_uppercase() as char);
            out.push(bytes[i + 2].to_ascii_uppercase() as char);
            i += 3;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}
