//! Job configuration as submitted by the scan orchestrator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::product_identifier_error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    pub key: String,
    pub value: String,
}

/// What to run and with which parameters.
///
/// Stored on the job record as its serialized JSON; the execution engine
/// never looks inside, only the product launcher does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfiguration {
    #[serde(rename = "sechubJobUUID")]
    pub sechub_job_uuid: Option<Uuid>,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub parameters: Vec<JobParameter>,
}

impl JobConfiguration {
    pub fn new(sechub_job_uuid: Uuid, product_id: impl Into<String>) -> Self {
        Self {
            sechub_job_uuid: Some(sechub_job_uuid),
            product_id: product_id.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(JobParameter {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Returns why the configuration cannot be accepted, or `None`.
    pub fn validation_error(&self) -> Option<String> {
        if self.sechub_job_uuid.is_none() {
            return Some("sechub job UUID not set!".to_string());
        }
        product_identifier_error(&self.product_id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
