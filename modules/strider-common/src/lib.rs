pub mod config;
pub mod error;
pub mod redact;
pub mod types;

pub use config::Config;
pub use error::StriderError;
pub use types::*;

/// Normalize a host + path into a filename-safe slug: lowercase, replace runs
/// of non-alphanumeric characters with a single hyphen, trim hyphens.
///
/// ```
/// assert_eq!(strider_common::slugify("app.example.org/Store/Item"), "app-example-org-store-item");
/// assert_eq!(strider_common::slugify("/api/v2/users"), "api-v2-users");
/// ```
pub fn slugify(input: &str) -> String {
    let lowered = input.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<&str>>().join("-")
}

/// Hex sha256 of arbitrary bytes. Content identity for dedup and manifests.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}
