//! Content routing: which processor consumes a response.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Html,
    Js,
    Api,
    /// Anything else. Never processed or stored.
    Binary,
}

impl Routed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Routed::Html => "html",
            Routed::Js => "js",
            Routed::Api => "api",
            Routed::Binary => "binary",
        }
    }
}

/// Route by content-type substring; when the header is missing, fall back
/// to a URL-extension guess restricted to the configured include set.
pub fn route(content_type: Option<&str>, path: &str, include_types: &[String]) -> Routed {
    match content_type {
        Some(ct) => route_content_type(ct),
        None => guess_from_extension(path, include_types),
    }
}

fn route_content_type(content_type: &str) -> Routed {
    let ct = content_type.to_lowercase();
    if ct.contains("text/html") || ct.contains("application/xhtml") {
        Routed::Html
    } else if ct.contains("javascript") {
        Routed::Js
    } else if ct.contains("json") {
        Routed::Api
    } else {
        Routed::Binary
    }
}

fn guess_from_extension(path: &str, include_types: &[String]) -> Routed {
    let included = |t: &str| include_types.iter().any(|i| i == t);
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase());

    match ext.as_deref() {
        Some("html") | Some("htm") if included("html") => Routed::Html,
        Some("js") | Some("mjs") if included("js") => Routed::Js,
        Some("json") if included("json") => Routed::Api,
        None if included("html") => Routed::Html,
        _ => Routed::Binary,
    }
}
