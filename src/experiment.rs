//! Cohort experimentation.
//!
//! Deterministic A/B assignment between the control arm (RAG-only prompts
//! regardless of retrieval quality) and the treatment arm (hybrid prompts
//! on thin retrieval). Assignments hash the session key so a session stays
//! in its cohort across requests.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::warn;

use crate::config::ExperimentationConfig;

/// Experiment arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cohort {
    /// Forces RAG-only prompting even on sparse retrieval
    Control,
    Treatment,
}

impl std::fmt::Display for Cohort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Treatment => write!(f, "treatment"),
        }
    }
}

#[derive(Debug, Serialize)]
struct AssignmentRecord<'a> {
    timestamp: String,
    session_hash: String,
    query: &'a str,
    cohort: Cohort,
}

/// Assigns sessions to cohorts and logs assignments.
pub struct ExperimentManager {
    /// Percentage of sessions landing in the control arm
    control_percent: u64,
    log_path: PathBuf,
}

impl ExperimentManager {
    const DEFAULT_CONTROL_PERCENT: u64 = 50;

    /// Build from config; `None` when experimentation is disabled.
    pub fn from_config(config: &ExperimentationConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let storage_dir = PathBuf::from(&config.storage_dir);
        Some(Self {
            control_percent: Self::DEFAULT_CONTROL_PERCENT,
            log_path: storage_dir.join("experiment_assignments.jsonl"),
        })
    }

    pub fn with_control_percent(mut self, percent: u64) -> Self {
        self.control_percent = percent.min(100);
        self
    }

    /// Deterministic assignment for a session key.
    pub fn cohort_for(&self, session_key: &str) -> Cohort {
        let digest = Sha256::digest(session_key.as_bytes());
        // First eight bytes give a uniform bucket in 0..100
        let bucket = u64::from_be_bytes(digest[..8].try_into().expect("digest too short")) % 100;
        if bucket < self.control_percent {
            Cohort::Control
        } else {
            Cohort::Treatment
        }
    }

    /// Append an assignment row. Best-effort; failures are logged and
    /// swallowed.
    pub async fn log_assignment(&self, session_key: &str, query: &str, cohort: Cohort) {
        let truncated_query: String = query.chars().take(100).collect();
        let record = AssignmentRecord {
            timestamp: Utc::now().to_rfc3339(),
            session_hash: format!("{:x}", Sha256::digest(session_key.as_bytes())),
            query: &truncated_query,
            cohort,
        };
        let Ok(mut line) = serde_json::to_string(&record) else {
            return;
        };
        line.push('\n');

        if let Some(parent) = self.log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("[experiment] cannot create storage dir: {e}");
                return;
            }
        }
        use tokio::io::AsyncWriteExt;
        let open = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await;
        match open {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("[experiment] cannot append assignment: {e}");
                }
            }
            Err(e) => warn!("[experiment] cannot open assignment log: {e}"),
        }
    }
}
