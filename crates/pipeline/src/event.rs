//! Inbound event shapes and their normalization into object references.
//!
//! Accepted JSON forms:
//!
//! | Shape | Example |
//! |---|---|
//! | health check | `{"action": "health"}`, `{"health": true}` |
//! | storage notifications | `{"Records": [{"s3": {"bucket": {"name": "b"}, "object": {"key": "k"}}}]}` |
//! | explicit list | `{"objects": [{"bucket": "b", "key": "k"}]}` |
//! | single object | `{"bucket": "b", "key": "k"}` |
//!
//! Any of them may arrive wrapped in an SNS notification envelope.

use keymaster_core::types::ObjectRef;
use serde::Deserialize;

/// A request handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum InboundEvent {
    HealthCheck(HealthCheck),
    Notifications {
        #[serde(rename = "Records")]
        records: Vec<StorageRecord>,
    },
    ObjectList {
        objects: Vec<ObjectRef>,
    },
    Object(ObjectRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum HealthCheck {
    Action { action: HealthAction },
    Flag { health: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthAction {
    Health,
}

/// One entry of a storage-change notification batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageRecord {
    pub s3: StorageEntity,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageEntity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectEntity {
    /// URL-encoded, with `+` for spaces.
    pub key: String,
}

#[derive(Deserialize)]
struct SnsEnvelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Message")]
    message: String,
}

impl InboundEvent {
    /// Parse a JSON document, unwrapping an SNS notification envelope
    /// when present.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        if let Ok(envelope) = serde_json::from_str::<SnsEnvelope>(text) {
            if envelope.kind == "Notification" {
                return serde_json::from_str(&envelope.message);
            }
        }
        serde_json::from_str(text)
    }

    /// Whether this is a health-check request. `{"health": false}` is not.
    pub fn is_health_check(&self) -> bool {
        matches!(
            self,
            Self::HealthCheck(HealthCheck::Action { .. })
                | Self::HealthCheck(HealthCheck::Flag { health: true })
        )
    }

    /// Flatten into object references, in input order. Health checks yield
    /// nothing.
    pub fn objects(&self) -> Vec<ObjectRef> {
        match self {
            Self::HealthCheck(_) => Vec::new(),
            Self::Notifications { records } => records
                .iter()
                .map(|r| ObjectRef::new(&r.s3.bucket.name, decode_key(&r.s3.object.key)))
                .collect(),
            Self::ObjectList { objects } => objects.clone(),
            Self::Object(object) => vec![object.clone()],
        }
    }
}

/// Undo the form encoding storage notifications apply to keys.
fn decode_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            tracing::warn!(key = raw, error = %e, "Object key is not valid percent-encoding, using as-is");
            spaced
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn storage_notification_keys_are_decoded() {
        let event = InboundEvent::from_json(
            r#"{"Records":[{"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"assets"},"object":{"key":"unprocessed/My+Pack%282%29.zip","size":10}}}]}"#,
        )
        .unwrap();
        assert_eq!(
            event.objects(),
            vec![ObjectRef::new("assets", "unprocessed/My Pack(2).zip")]
        );
    }

    #[test]
    fn single_and_list_shapes() {
        let single = InboundEvent::from_json(r#"{"bucket":"b","key":"unprocessed/a.zip"}"#).unwrap();
        assert_matches!(single, InboundEvent::Object(_));
        assert_eq!(single.objects().len(), 1);

        let list = InboundEvent::from_json(
            r#"{"objects":[{"bucket":"b","key":"x"},{"bucket":"c","key":"y"}]}"#,
        )
        .unwrap();
        assert_eq!(
            list.objects(),
            vec![ObjectRef::new("b", "x"), ObjectRef::new("c", "y")]
        );
    }

    #[test]
    fn health_checks() {
        assert!(InboundEvent::from_json(r#"{"action":"health"}"#).unwrap().is_health_check());
        assert!(InboundEvent::from_json(r#"{"health":true}"#).unwrap().is_health_check());

        let off = InboundEvent::from_json(r#"{"health":false}"#).unwrap();
        assert!(!off.is_health_check());
        assert!(off.objects().is_empty());

        assert!(InboundEvent::from_json(r#"{"action":"reboot"}"#).is_err());
    }

    #[test]
    fn sns_envelope_is_unwrapped() {
        let inner = r#"{"bucket":"b","key":"unprocessed/a.zip"}"#;
        let wrapped = serde_json::json!({
            "Type": "Notification",
            "MessageId": "1",
            "Message": inner,
        })
        .to_string();
        assert_eq!(
            InboundEvent::from_json(&wrapped).unwrap(),
            InboundEvent::Object(ObjectRef::new("b", "unprocessed/a.zip"))
        );
    }

    #[test]
    fn unrelated_json_is_rejected() {
        assert!(InboundEvent::from_json(r#"{"hello":"world"}"#).is_err());
        assert!(InboundEvent::from_json("not json").is_err());
    }
}
