//! Record types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ArtifactRef, StorageError};

pub type JobId = i64;

/// Prediction job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(StorageError::SerializationError(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// One asynchronous prediction request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionJob {
    pub id: JobId,
    pub model_id: i64,
    /// Model cache key the job runs against
    pub model_key: String,
    /// Artifact name of the uploaded image
    pub input_name: String,
    pub input_image: String,
    pub output_image: Option<String>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PredictionJob {
    /// Apply the single terminal write; refused unless the job is pending
    pub(crate) fn finish(
        &mut self,
        status: JobStatus,
        output_image: Option<String>,
        error: Option<String>,
    ) -> Result<(), StorageError> {
        if self.status.is_terminal() {
            return Err(StorageError::InvalidTransition {
                id: self.id,
                status: self.status,
            });
        }
        self.status = status;
        self.output_image = output_image;
        self.error = error;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Fields supplied when creating a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub model_id: i64,
    pub model_key: String,
    pub input: ArtifactRef,
}

/// A registered segmentation model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub instructions: Option<String>,
    /// Preview image URL
    pub image: Option<String>,
    pub author: Option<String>,
    pub date: Option<String>,
    pub category: Option<String>,
    /// Model cache key, the file stem under the model directory
    pub model_file: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when registering a model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewModel {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub model_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job() -> PredictionJob {
        PredictionJob {
            id: 7,
            model_id: 1,
            model_key: "nitride".to_string(),
            input_name: "input.png".to_string(),
            input_image: "https://example.test/media/input.png".to_string(),
            output_image: None,
            status: JobStatus::Pending,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [JobStatus::Pending, JobStatus::Done, JobStatus::Error] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Done).unwrap(), "\"done\"");
        let parsed: JobStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, JobStatus::Error);
    }

    #[test]
    fn test_finish_only_once() {
        let mut job = pending_job();
        job.finish(JobStatus::Done, Some("out.png".into()), None).unwrap();
        assert_eq!(job.status, JobStatus::Done);

        let again = job.finish(JobStatus::Error, None, Some("late".into()));
        assert!(matches!(
            again,
            Err(StorageError::InvalidTransition {
                id: 7,
                status: JobStatus::Done
            })
        ));
        assert_eq!(job.output_image.as_deref(), Some("out.png"));
    }
}
