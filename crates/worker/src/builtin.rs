//! Jobs every worker deployment can run.

use serde::{Deserialize, Serialize};

use forgejobs_infra::JobResult;
use forgejobs_infra::jobs::{Job, JobRegistry, Payload, to_payload};

pub const LOG_MESSAGE: &str = "log_message";

/// Writes its message to the worker log. Used to smoke-test a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub message: String,
}

impl Job for LogMessage {
    fn job_type(&self) -> &str {
        LOG_MESSAGE
    }

    fn handle(&self) -> anyhow::Result<()> {
        tracing::info!(message = %self.message, "log_message job executed");
        Ok(())
    }

    fn payload(&self) -> JobResult<Payload> {
        to_payload(self)
    }

    fn max_attempts(&self) -> u32 {
        1
    }
}

/// Registry with every built-in job type.
pub fn registry() -> JobRegistry {
    JobRegistry::new().with_serde::<LogMessage>(LOG_MESSAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_message_is_registered_and_rebuilds() {
        let registry = registry();
        assert_eq!(registry.job_types(), vec![LOG_MESSAGE]);

        let job = LogMessage {
            message: "hello".to_string(),
        };
        let rebuilt = registry.build(LOG_MESSAGE, &job.payload().unwrap()).unwrap();
        assert_eq!(rebuilt.payload().unwrap(), job.payload().unwrap());
        assert!(rebuilt.handle().is_ok());
    }
}
