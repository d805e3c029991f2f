use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A step an operation will emit: stable id + display name.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StepDescriptor {
    pub id: String,
    pub name: String,
}

impl StepDescriptor {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Completed,
    Error,
    Timeout,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::InProgress)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Error | StepStatus::Skipped
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProvisioningStep {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&StepDescriptor> for ProvisioningStep {
    fn from(d: &StepDescriptor) -> Self {
        Self {
            id: d.id.clone(),
            name: d.name.clone(),
            status: StepStatus::Pending,
            message: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProvisioningProgress {
    pub instance_id: Uuid,
    pub operation_id: Uuid,
    pub status: ProgressStatus,
    pub current_step: Option<String>,
    pub steps: Vec<ProvisioningStep>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ProvisioningProgress {
    pub fn new(instance_id: Uuid, steps: &[StepDescriptor]) -> Self {
        Self {
            instance_id,
            operation_id: Uuid::new_v4(),
            status: ProgressStatus::InProgress,
            current_step: steps.first().map(|s| s.id.clone()),
            steps: steps.iter().map(ProvisioningStep::from).collect(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&ProvisioningStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn in_progress_step(&self) -> Option<&ProvisioningStep> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::InProgress)
    }

    pub fn in_progress_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::InProgress)
            .count()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProvisioningLogEntry {
    pub instance_id: Uuid,
    pub step_id: Option<String>,
    pub stream: LogStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}
