//! Layered decoding of queue message bodies.
//!
//! 1. **Strict**: the body is a known [`InboundEvent`], possibly inside an
//!    SNS envelope.
//! 2. **Heuristic**: the body is not a known event, but `s3://bucket/key`
//!    URIs or `"bucket"`/`"key"` pairs can be pulled out of it.
//! 3. **Raw**: nothing usable; the body is kept for the failure report.
//!
//! Decoding never fails, so a malformed message cannot take the loop down.

use std::sync::LazyLock;

use keymaster_core::types::{JobResult, ObjectRef};
use keymaster_pipeline::{DispatchError, DispatchOutcome, Dispatcher, InboundEvent};
use regex::Regex;

/// Longest body excerpt quoted in a malformed-input error.
const RAW_EXCERPT_LEN: usize = 200;

static S3_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"s3://([a-z0-9][a-z0-9.\-]{1,62})/([^\s"'<>,\]\}]+)"#).expect("valid regex")
});

static BUCKET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""bucket"\s*:\s*(?:\{\s*"name"\s*:\s*)?"([^"]+)""#).expect("valid regex")
});

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""key"\s*:\s*"([^"]+)""#).expect("valid regex"));

/// A message body after layered decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPayload {
    Strict(InboundEvent),
    Heuristic(Vec<ObjectRef>),
    Raw(String),
}

impl DecodedPayload {
    /// Name of the tier that produced this payload, for logs.
    pub fn tier(&self) -> &'static str {
        match self {
            Self::Strict(_) => "strict",
            Self::Heuristic(_) => "heuristic",
            Self::Raw(_) => "raw",
        }
    }

    /// Turn the payload into something the dispatcher accepts.
    pub fn into_event(self) -> Result<InboundEvent, DispatchError> {
        match self {
            Self::Strict(event) => Ok(event),
            Self::Heuristic(objects) => Ok(InboundEvent::ObjectList { objects }),
            Self::Raw(body) => Err(DispatchError::MalformedInput(excerpt(&body))),
        }
    }
}

/// Decode `body`, falling through strict, heuristic and raw tiers.
pub fn decode(body: &str) -> DecodedPayload {
    if let Ok(event) = InboundEvent::from_json(body) {
        return DecodedPayload::Strict(event);
    }

    let objects = extract_objects(body);
    if !objects.is_empty() {
        return DecodedPayload::Heuristic(objects);
    }

    DecodedPayload::Raw(body.to_string())
}

/// Best-effort object extraction from near-miss text.
fn extract_objects(body: &str) -> Vec<ObjectRef> {
    let from_uris: Vec<ObjectRef> = S3_URI_RE
        .captures_iter(body)
        .map(|c| ObjectRef::new(&c[1], &c[2]))
        .collect();
    if !from_uris.is_empty() {
        return from_uris;
    }

    let buckets: Vec<&str> = BUCKET_RE
        .captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let keys: Vec<&str> = KEY_RE
        .captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();

    match buckets.as_slice() {
        [] => Vec::new(),
        // One bucket applies to every key found.
        [bucket] => keys.iter().map(|k| ObjectRef::new(*bucket, *k)).collect(),
        _ => buckets
            .iter()
            .zip(keys.iter())
            .map(|(b, k)| ObjectRef::new(*b, *k))
            .collect(),
    }
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(RAW_EXCERPT_LEN) {
        Some((idx, _)) => format!("unrecognized payload: {}…", &trimmed[..idx]),
        None => format!("unrecognized payload: {trimmed}"),
    }
}

/// Decode `body` and dispatch it. An undecodable body becomes a single
/// failed result attributed to `origin`, so it is reported like any other
/// job failure instead of aborting the caller.
pub async fn dispatch_payload(dispatcher: &Dispatcher, origin: &str, body: &str) -> DispatchOutcome {
    let decoded = decode(body);
    let tier = decoded.tier();
    match decoded.into_event() {
        Ok(event) => {
            tracing::debug!(origin, tier, "Payload decoded");
            dispatcher.dispatch(&event).await
        }
        Err(e) => {
            tracing::warn!(origin, error = %e, "Payload could not be decoded");
            DispatchOutcome::Processed {
                results: vec![JobResult::failed(origin, e.to_string())],
                skipped: Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn strict_tier_accepts_known_shapes() {
        let decoded = decode(r#"{"bucket":"assets","key":"unprocessed/a.zip"}"#);
        assert_eq!(decoded.tier(), "strict");
        assert_matches!(decoded, DecodedPayload::Strict(InboundEvent::Object(o)) if o.key == "unprocessed/a.zip");
    }

    #[test]
    fn strict_tier_unwraps_sns() {
        let body = serde_json::json!({
            "Type": "Notification",
            "Message": r#"{"Records":[{"s3":{"bucket":{"name":"assets"},"object":{"key":"unprocessed/b.zip"}}}]}"#,
        })
        .to_string();
        let event = assert_matches!(decode(&body), DecodedPayload::Strict(e) => e);
        assert_eq!(event.objects(), vec![ObjectRef::new("assets", "unprocessed/b.zip")]);
    }

    #[test]
    fn heuristic_tier_finds_uris() {
        let decoded = decode("please run s3://assets/unprocessed/c.zip and s3://other/unprocessed/d.zip");
        assert_eq!(
            decoded,
            DecodedPayload::Heuristic(vec![
                ObjectRef::new("assets", "unprocessed/c.zip"),
                ObjectRef::new("other", "unprocessed/d.zip"),
            ])
        );
    }

    #[test]
    fn heuristic_tier_finds_pairs_in_broken_json() {
        // Trailing comma makes this invalid JSON.
        let decoded = decode(r#"{"bucket": "assets", "key": "unprocessed/e.zip",}"#);
        assert_eq!(
            decoded,
            DecodedPayload::Heuristic(vec![ObjectRef::new("assets", "unprocessed/e.zip")])
        );

        let nested = decode(r#"{"s3": {"bucket": {"name": "assets"}, "object": {"key": "unprocessed/f.zip"}}"#);
        assert_eq!(
            nested,
            DecodedPayload::Heuristic(vec![ObjectRef::new("assets", "unprocessed/f.zip")])
        );
    }

    #[test]
    fn raw_tier_is_malformed_input() {
        let decoded = decode("hello there");
        assert_eq!(decoded.tier(), "raw");
        assert_matches!(
            decoded.into_event(),
            Err(DispatchError::MalformedInput(msg)) if msg == "unrecognized payload: hello there"
        );

        assert_matches!(decode(r#"{"hello":"world"}"#), DecodedPayload::Raw(_));
    }

    #[test]
    fn long_raw_bodies_are_truncated() {
        let body = "x".repeat(1000);
        let msg = excerpt(&body);
        assert!(msg.chars().count() < 250);
        assert!(msg.ends_with('…'));
    }
}
