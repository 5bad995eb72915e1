//! The `Job` contract: one executable task plus its retry policy.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use forgejobs_core::{JobError, JobResult};

use super::types::{BackoffStrategy, RetryPolicy};

/// Serialized job data: a flat key/value map of primitives and arrays.
pub type Payload = Map<String, Value>;

/// A user-defined unit of work.
///
/// Implementations are rebuilt from their payload by a [`JobRegistry`] factory
/// before every attempt, so `payload` must capture everything `handle` needs
/// and nothing that cannot be stored (connections, handles, caches).
///
/// Retried jobs should be idempotent: an attempt may fail (or the worker may
/// die) after some side effects already happened.
///
/// The policy accessors are read once at enqueue time and frozen into the
/// record; they must be pure.
///
/// [`JobRegistry`]: super::registry::JobRegistry
pub trait Job: Send + Sync {
    /// Registry key identifying how to rebuild this job.
    fn job_type(&self) -> &str;

    /// Perform the work. Any error (or panic) fails the current attempt.
    fn handle(&self) -> anyhow::Result<()>;

    /// Serialize the job into the payload stored with the record.
    fn payload(&self) -> JobResult<Payload>;

    fn max_attempts(&self) -> u32 {
        3
    }

    fn retry_delay_seconds(&self) -> u64 {
        60
    }

    fn timeout_seconds(&self) -> u64 {
        300
    }

    fn backoff(&self) -> BackoffStrategy {
        BackoffStrategy::Fixed
    }

    /// Called at most once, after the final attempt failed.
    ///
    /// Errors returned here are logged and otherwise ignored.
    fn on_failed(&self, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// The policy frozen into the record on dispatch.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts(),
            self.retry_delay_seconds(),
            self.timeout_seconds(),
        )
        .with_backoff(self.backoff())
    }
}

/// Serialize a value into a flat payload map.
///
/// The value must serialize to a JSON object whose fields are primitives or
/// arrays; nested objects are rejected.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> JobResult<Payload> {
    let value = serde_json::to_value(value).map_err(|e| JobError::serialization(e.to_string()))?;
    match value {
        Value::Object(map) => {
            validate_payload(&map)?;
            Ok(map)
        }
        Value::Null => Ok(Payload::new()),
        other => Err(JobError::invalid_payload(format!(
            "expected a key/value map, got {}",
            kind_of(&other)
        ))),
    }
}

/// Rebuild a value from its payload map.
pub fn from_payload<T: DeserializeOwned>(payload: &Payload) -> JobResult<T> {
    serde_json::from_value(Value::Object(payload.clone()))
        .map_err(|e| JobError::invalid_payload(e.to_string()))
}

/// Check that a payload is flat: no field holds an object, at any array depth.
pub fn validate_payload(payload: &Payload) -> JobResult<()> {
    fn check(key: &str, value: &Value) -> JobResult<()> {
        match value {
            Value::Object(_) => Err(JobError::invalid_payload(format!(
                "field `{key}` is a nested object"
            ))),
            Value::Array(items) => items.iter().try_for_each(|item| check(key, item)),
            _ => Ok(()),
        }
    }

    payload.iter().try_for_each(|(key, value)| check(key, value))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct SendEmail {
        to: String,
        subject: String,
        cc: Vec<String>,
        priority: u8,
    }

    impl Job for SendEmail {
        fn job_type(&self) -> &str {
            "send_email"
        }

        fn handle(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn payload(&self) -> JobResult<Payload> {
            to_payload(self)
        }

        fn max_attempts(&self) -> u32 {
            5
        }
    }

    #[test]
    fn payload_round_trip() {
        let job = SendEmail {
            to: "ops@example.com".to_string(),
            subject: "Nightly report".to_string(),
            cc: vec!["a@example.com".to_string()],
            priority: 2,
        };

        let payload = job.payload().unwrap();
        assert_eq!(payload["to"], json!("ops@example.com"));

        let back: SendEmail = from_payload(&payload).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn nested_objects_are_rejected() {
        let err = to_payload(&json!({"user": {"id": 1}})).unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));

        let err = to_payload(&json!({"users": [[{"id": 1}]]})).unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));
    }

    #[test]
    fn scalars_are_rejected_and_unit_is_empty() {
        assert!(to_payload(&42).is_err());
        assert!(to_payload(&()).unwrap().is_empty());
    }

    #[test]
    fn default_policy_uses_accessors() {
        let job = SendEmail {
            to: String::new(),
            subject: String::new(),
            cc: vec![],
            priority: 0,
        };

        let policy = job.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.retry_delay_seconds, 60);
        assert_eq!(policy.timeout_seconds, 300);
        assert_eq!(policy.backoff, BackoffStrategy::Fixed);
    }

    #[test]
    fn mismatched_payload_is_invalid() {
        let payload = to_payload(&json!({"to": 7})).unwrap();
        let err = from_payload::<SendEmail>(&payload).unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));
    }
}
