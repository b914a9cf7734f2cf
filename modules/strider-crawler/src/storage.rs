//! Deterministic artifact placement under the output root, with atomic
//! write-temp-then-rename so a killed process never leaves half a file.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use strider_common::config::OutputConfig;
use strider_common::{slugify, ArtifactKind, StriderError};

use crate::canonical::CanonicalUrl;

/// Longest slug kept in a filename; the md5 suffix keeps truncated names unique.
const SLUG_MAX_LEN: usize = 80;

pub struct Storage {
    root: PathBuf,
    pages_dir: String,
    js_dir: String,
    api_dir: String,
    /// Relative paths handed out this run, so collisions are resolved
    /// before anything touches the filesystem.
    claimed: HashSet<String>,
}

impl Storage {
    pub fn new(output: &OutputConfig) -> Result<Self, StriderError> {
        let root = output.root_dir.clone();
        for dir in [
            &output.store_pages_under,
            &output.store_js_under,
            &output.store_api_under,
        ] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root,
            pages_dir: output.store_pages_under.clone(),
            js_dir: output.store_js_under.clone(),
            api_dir: output.store_api_under.clone(),
            claimed: HashSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derive (and claim) the relative path for an artifact.
    pub fn path_for(&mut self, kind: ArtifactKind, url: &CanonicalUrl) -> String {
        let suffix = md5_prefix(&url.canonical);
        let candidate = match kind {
            ArtifactKind::Html => {
                if url.path == "/" {
                    format!("{}/index.html", self.pages_dir)
                } else {
                    format!("{}/{}-{}.html", self.pages_dir, url_slug(url), suffix)
                }
            }
            ArtifactKind::Js => {
                let basename = js_basename(&url.path);
                format!("{}/{}", self.js_dir, basename)
            }
            ArtifactKind::Api => {
                format!("{}/{}-{}.json", self.api_dir, url_slug(url), suffix)
            }
        };

        let resolved = if self.claimed.contains(&candidate) {
            with_hash_suffix(&candidate, &suffix)
        } else {
            candidate
        };
        self.claimed.insert(resolved.clone());
        resolved
    }

    /// Write bytes to a claimed relative path. Refuses to overwrite: two
    /// artifacts resolving to one path means the collision handling is
    /// broken, which is fatal.
    pub fn write_atomic(&self, relative: &str, bytes: &[u8]) -> Result<u64, StriderError> {
        let target = self.root.join(relative);
        let parent = target
            .parent()
            .ok_or_else(|| StriderError::Storage(format!("no parent dir for {relative}")))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(bytes)?;
        temp.flush()?;
        temp.persist_noclobber(&target).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                StriderError::StorageCollision(relative.to_string())
            } else {
                StriderError::Io(e.error)
            }
        })?;
        Ok(bytes.len() as u64)
    }
}

/// Atomically replace a file's contents (manifest, checkpoint). The rename
/// stays within the target's directory so it cannot cross filesystems.
pub fn atomic_overwrite(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other(format!("no parent dir for {}", path.display())))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.persist(path)?;
    Ok(())
}

fn url_slug(url: &CanonicalUrl) -> String {
    let mut slug = slugify(&format!("{}{}", url.host, url.path));
    if slug.is_empty() {
        slug.push_str("root");
    }
    slug.truncate(SLUG_MAX_LEN);
    slug.trim_end_matches('-').to_string()
}

fn js_basename(path: &str) -> String {
    let segment = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("");
    if segment.is_empty() {
        return "index.js".to_string();
    }
    if segment.ends_with(".js") || segment.ends_with(".mjs") {
        segment.to_string()
    } else {
        format!("{segment}.js")
    }
}

/// `js/app.js` + `1a2b3c4d` → `js/app-1a2b3c4d.js`.
fn with_hash_suffix(path: &str, suffix: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{suffix}.{ext}"),
        None => format!("{path}-{suffix}"),
    }
}

fn md5_prefix(canonical: &str) -> String {
    let digest = format!("{:x}", md5::compute(canonical.as_bytes()));
    digest[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Canonicalizer;

    fn storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let output = OutputConfig {
            root_dir: dir.path().to_path_buf(),
            store_pages_under: "pages".to_string(),
            store_js_under: "js".to_string(),
            store_api_under: "api".to_string(),
        };
        (Storage::new(&output).unwrap(), dir)
    }

    fn url(raw: &str) -> CanonicalUrl {
        Canonicalizer::new(&[], true).canonicalize(raw, None).unwrap()
    }

    #[test]
    fn host_root_maps_to_index_html() {
        let (mut s, _dir) = storage();
        assert_eq!(
            s.path_for(ArtifactKind::Html, &url("https://a.test/")),
            "pages/index.html"
        );
        // A second root (other host) cannot steal the same name.
        let second = s.path_for(ArtifactKind::Html, &url("https://b.a.test/"));
        assert_ne!(second, "pages/index.html");
        assert!(second.starts_with("pages/index-"));
    }

    #[test]
    fn html_paths_are_slugged_and_suffixed() {
        let (mut s, _dir) = storage();
        let path = s.path_for(ArtifactKind::Html, &url("https://a.test/Store/Item"));
        assert!(path.starts_with("pages/a-test-store-item-"));
        assert!(path.ends_with(".html"));
    }

    #[test]
    fn js_keeps_basename_until_collision() {
        let (mut s, _dir) = storage();
        let first = s.path_for(ArtifactKind::Js, &url("https://a.test/static/app.js"));
        assert_eq!(first, "js/app.js");
        let second = s.path_for(ArtifactKind::Js, &url("https://a.test/other/app.js"));
        assert_ne!(first, second);
        assert!(second.starts_with("js/app-"));
        assert!(second.ends_with(".js"));
    }

    #[test]
    fn api_paths_include_slug_and_hash() {
        let (mut s, _dir) = storage();
        let path = s.path_for(ArtifactKind::Api, &url("https://a.test/api/v1/users"));
        assert!(path.starts_with("api/a-test-api-v1-users-"));
        assert!(path.ends_with(".json"));
    }

    #[test]
    fn identical_url_derives_identical_path_shape() {
        let u = url("https://a.test/api/v1/users");
        let (mut s1, _d1) = storage();
        let (mut s2, _d2) = storage();
        assert_eq!(
            s1.path_for(ArtifactKind::Api, &u),
            s2.path_for(ArtifactKind::Api, &u)
        );
    }

    #[test]
    fn write_atomic_refuses_overwrite() {
        let (s, _dir) = storage();
        assert_eq!(s.write_atomic("pages/x.html", b"one").unwrap(), 3);
        let err = s.write_atomic("pages/x.html", b"two").unwrap_err();
        assert!(matches!(err, StriderError::StorageCollision(_)));
        let kept = std::fs::read_to_string(s.root().join("pages/x.html")).unwrap();
        assert_eq!(kept, "one");
    }

    #[test]
    fn atomic_overwrite_replaces_contents() {
        let (s, _dir) = storage();
        let path = s.root().join("manifest.json");
        atomic_overwrite(&path, b"{\"v\":1}").unwrap();
        atomic_overwrite(&path, b"{\"v\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\":2}");
    }

    #[test]
    fn long_paths_truncate_but_stay_unique() {
        let (mut s, _dir) = storage();
        let long_a = format!("https://a.test/{}", "alpha/".repeat(30));
        let long_b = format!("https://a.test/{}x", "alpha/".repeat(30));
        let pa = s.path_for(ArtifactKind::Html, &url(&long_a));
        let pb = s.path_for(ArtifactKind::Html, &url(&long_b));
        assert_ne!(pa, pb);
        assert!(pa.len() < 120);
    }
}
