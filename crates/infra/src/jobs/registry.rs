//! Explicit `job_type → factory` mapping used to rebuild jobs from records.

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use forgejobs_core::{JobError, JobResult};

use super::job::{Job, Payload, from_payload};

/// Rebuilds a job from its stored payload.
pub type JobFactory = Box<dyn Fn(&Payload) -> JobResult<Box<dyn Job>> + Send + Sync>;

/// Registry of job types known to this process.
///
/// Populated at startup by the host; the scheduler only reads it.
#[derive(Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a job type, replacing any previous one.
    pub fn register<F>(&mut self, job_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Payload) -> JobResult<Box<dyn Job>> + Send + Sync + 'static,
    {
        self.factories.insert(job_type.into(), Box::new(factory));
        self
    }

    /// Register a job whose payload is its serde representation.
    pub fn register_serde<J>(&mut self, job_type: impl Into<String>) -> &mut Self
    where
        J: Job + DeserializeOwned + 'static,
    {
        self.register(job_type, |payload| {
            let job: J = from_payload(payload)?;
            Ok(Box::new(job) as Box<dyn Job>)
        })
    }

    /// Builder-style [`JobRegistry::register_serde`].
    pub fn with_serde<J>(mut self, job_type: impl Into<String>) -> Self
    where
        J: Job + DeserializeOwned + 'static,
    {
        self.register_serde::<J>(job_type);
        self
    }

    /// Rebuild a job from a stored type and payload.
    pub fn build(&self, job_type: &str, payload: &Payload) -> JobResult<Box<dyn Job>> {
        let factory = self
            .factories
            .get(job_type)
            .ok_or_else(|| JobError::unknown_job_type(job_type))?;
        factory(payload)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::to_payload;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    impl Job for Greet {
        fn job_type(&self) -> &str {
            "greet"
        }

        fn handle(&self) -> anyhow::Result<()> {
            anyhow::ensure!(!self.name.is_empty(), "nobody to greet");
            Ok(())
        }

        fn payload(&self) -> JobResult<Payload> {
            to_payload(self)
        }
    }

    #[test]
    fn builds_registered_job() {
        let registry = JobRegistry::new().with_serde::<Greet>("greet");

        let payload = to_payload(&json!({"name": "Ada"})).unwrap();
        let job = registry.build("greet", &payload).unwrap();

        assert_eq!(job.job_type(), "greet");
        assert!(job.handle().is_ok());
    }

    #[test]
    fn unknown_type_is_reported() {
        let registry = JobRegistry::new();
        let err = registry.build("missing", &Payload::new()).err().unwrap();
        assert_eq!(err, JobError::UnknownJobType("missing".to_string()));
    }

    #[test]
    fn bad_payload_is_invalid() {
        let registry = JobRegistry::new().with_serde::<Greet>("greet");
        let err = registry.build("greet", &Payload::new()).err().unwrap();
        assert!(matches!(err, JobError::InvalidPayload(_)));
    }

    #[test]
    fn custom_factory_and_listing() {
        let mut registry = JobRegistry::new();
        registry
            .register("anonymous", |_payload| {
                Ok(Box::new(Greet {
                    name: "anonymous".to_string(),
                }) as Box<dyn Job>)
            })
            .register_serde::<Greet>("greet");

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("anonymous"));
        assert_eq!(registry.job_types(), vec!["anonymous", "greet"]);
        assert!(registry.build("anonymous", &Payload::new()).is_ok());
    }
}
