//! JSON/API response capture: validator dedup, recursive redaction,
//! family quota, atomic save.
//!
//! The stored file holds the redacted representation; the artifact keeps
//! the sha256 of the original bytes for traceability.

use chrono::Utc;
use tracing::debug;

use strider_common::redact::{redact_json, redact_text};
use strider_common::{sha256_hex, Artifact, ArtifactKind, CodexEntry, EndpointRecord};

use crate::canonical::CanonicalUrl;
use crate::dedup::Validators;
use crate::family::{FamilyVerdict, SampleStats};
use crate::fetcher::FetchResponse;
use crate::scheduler::WorkItem;

use super::{ProcessError, ProcessOutcome, Verdict};

pub fn process(
    item: &WorkItem,
    url: &CanonicalUrl,
    response: &FetchResponse,
    deps: &mut super::ProcessorDeps<'_>,
) -> Result<ProcessOutcome, ProcessError> {
    let sha256 = sha256_hex(&response.body);
    if deps.dedup.seen_content(&sha256) {
        debug!(url = %url.canonical, "duplicate api body");
        return Ok(ProcessOutcome::skipped(Verdict::Duplicate));
    }

    let validators = Validators {
        etag: response.header("etag").map(String::from),
        last_modified: response.header("last-modified").map(String::from),
    };
    if deps.dedup.validators_unchanged(&url.url_key, &validators) {
        debug!(url = %url.canonical, "validators unchanged");
        return Ok(ProcessOutcome::skipped(Verdict::Duplicate));
    }

    // Parse failure is not an error: the body is kept opaque and redacted
    // at string level.
    let (stored, redaction_count) = match serde_json::from_slice::<serde_json::Value>(
        &response.body,
    ) {
        Ok(mut value) => {
            let count = redact_json(&mut value);
            let bytes = serde_json::to_vec_pretty(&value)
                .map_err(|e| ProcessError::Parse(e.to_string()))?;
            (bytes, count)
        }
        Err(e) => {
            debug!(url = %url.canonical, error = %e, "body is not json, redacting as text");
            let (text, count) = redact_text(&String::from_utf8_lossy(&response.body));
            (text.into_bytes(), count)
        }
    };
    let redacted = redaction_count > 0;

    let stats = SampleStats {
        title_len: 0,
        body_len: response.body.len(),
        status: response.status,
    };
    let family_key = deps.families.key_for(url);
    if deps.families.admit(&family_key, &stats) == FamilyVerdict::Saturated {
        deps.families.commit_skip(&family_key);
        return Ok(ProcessOutcome::skipped(Verdict::FamilySkipped));
    }

    let path = deps.storage.path_for(ArtifactKind::Api, url);
    let size = deps.storage.write_atomic(&path, &stored)?;

    deps.dedup.mark_content(&sha256);
    deps.dedup.record_validators(&url.url_key, validators);
    deps.families.commit_save(&family_key, stats);

    let artifact = Artifact {
        kind: ArtifactKind::Api,
        url: url.canonical.clone(),
        path: path.clone(),
        sha256: sha256.clone(),
        size,
        status: response.status,
        depth: item.meta.depth,
        captured_at: Utc::now(),
        redacted,
        signal: None,
    };
    let codex = CodexEntry {
        path,
        kind: ArtifactKind::Api,
        sha256,
        url: url.canonical.clone(),
        priority: item.score,
        hints: if redacted {
            vec!["redacted".to_string()]
        } else {
            Vec::new()
        },
    };

    let mut outcome = ProcessOutcome::saved(artifact, codex);
    outcome.endpoints = vec![EndpointRecord {
        url: url.canonical.clone(),
        source: "api".to_string(),
        score: item.score,
    }];
    Ok(outcome)
}
