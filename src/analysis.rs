//! Append-only analysis logs.
//!
//! Observational CSV sinks under `data/analysis/`. Producers never block:
//! records go through a bounded in-memory queue and the oldest record is
//! dropped on overflow — a lost audit row is preferable to a stalled
//! pipeline.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One record destined for an analysis CSV.
#[derive(Debug)]
pub enum AnalysisRecord {
    Emergency {
        timestamp: DateTime<Utc>,
        query: String,
        severity: String,
        detected_keywords: Vec<String>,
        score: f64,
    },
    SafetyFallback {
        timestamp: DateTime<Utc>,
        query: String,
        error_type: String,
    },
    LowCitation {
        timestamp: DateTime<Utc>,
        query: String,
        citation_count: usize,
        response_length: usize,
        response_preview: String,
    },
    LowRelevancy {
        timestamp: DateTime<Utc>,
        query: String,
        overlap: f64,
        missing_terms: Vec<String>,
        response_preview: String,
    },
    Hallucination {
        timestamp: DateTime<Utc>,
        query: String,
        category: String,
        claim: String,
        confidence: f64,
    },
    /// Test/shutdown hook: resolves once everything queued before it hit disk
    Flush(oneshot::Sender<()>),
}

impl AnalysisRecord {
    fn file_name(&self) -> &'static str {
        match self {
            Self::Emergency { .. } => "emergency_queries.csv",
            Self::SafetyFallback { .. } => "safety_fallback_log.csv",
            Self::LowCitation { .. } => "low_citation_responses.csv",
            Self::LowRelevancy { .. } => "low_relevancy_responses.csv",
            Self::Hallucination { .. } => "hallucination_log.csv",
            Self::Flush(_) => "",
        }
    }

    fn header(&self) -> &'static [&'static str] {
        match self {
            Self::Emergency { .. } => {
                &["timestamp", "query", "severity_level", "detected_keywords", "severity_score"]
            }
            Self::SafetyFallback { .. } => {
                &["timestamp", "query", "error_type", "fallback_triggered"]
            }
            Self::LowCitation { .. } => {
                &["timestamp", "query", "citation_count", "response_length", "response_preview"]
            }
            Self::LowRelevancy { .. } => {
                &["timestamp", "query", "overlap_percentage", "missing_terms", "response_preview"]
            }
            Self::Hallucination { .. } => {
                &["timestamp", "query", "category", "claim", "confidence"]
            }
            Self::Flush(_) => &[],
        }
    }

    fn row(&self) -> Vec<String> {
        match self {
            Self::Emergency {
                timestamp,
                query,
                severity,
                detected_keywords,
                score,
            } => vec![
                timestamp.to_rfc3339(),
                query.clone(),
                severity.clone(),
                detected_keywords.join(";"),
                format!("{score:.2}"),
            ],
            Self::SafetyFallback {
                timestamp,
                query,
                error_type,
            } => vec![
                timestamp.to_rfc3339(),
                query.clone(),
                error_type.clone(),
                "true".to_string(),
            ],
            Self::LowCitation {
                timestamp,
                query,
                citation_count,
                response_length,
                response_preview,
            } => vec![
                timestamp.to_rfc3339(),
                query.clone(),
                citation_count.to_string(),
                response_length.to_string(),
                response_preview.clone(),
            ],
            Self::LowRelevancy {
                timestamp,
                query,
                overlap,
                missing_terms,
                response_preview,
            } => vec![
                timestamp.to_rfc3339(),
                query.clone(),
                format!("{:.1}%", overlap * 100.0),
                missing_terms.join(", "),
                response_preview.clone(),
            ],
            Self::Hallucination {
                timestamp,
                query,
                category,
                claim,
                confidence,
            } => vec![
                timestamp.to_rfc3339(),
                query.clone(),
                category.clone(),
                claim.clone(),
                format!("{confidence:.2}"),
            ],
            Self::Flush(_) => Vec::new(),
        }
    }
}

/// Bounded fire-and-forget CSV sink.
pub struct AnalysisLog {
    queue: Arc<Mutex<VecDeque<AnalysisRecord>>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl AnalysisLog {
    pub const DEFAULT_CAPACITY: usize = 512;

    /// Spawn the writer task over `analysis_dir`.
    pub fn new(analysis_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_capacity(analysis_dir, Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(analysis_dir: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let analysis_dir = analysis_dir.into();
        std::fs::create_dir_all(&analysis_dir)
            .map_err(|e| Error::Storage(format!("Cannot create analysis dir: {e}")))?;

        let queue: Arc<Mutex<VecDeque<AnalysisRecord>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());

        {
            let queue = Arc::clone(&queue);
            let notify = Arc::clone(&notify);
            tokio::spawn(async move {
                loop {
                    let record = {
                        let mut q = queue.lock().unwrap_or_else(|p| p.into_inner());
                        q.pop_front()
                    };
                    match record {
                        Some(AnalysisRecord::Flush(ack)) => {
                            let _ = ack.send(());
                        }
                        Some(record) => {
                            if let Err(e) = write_record(&analysis_dir, &record) {
                                warn!("[analysis] dropping record: {e}");
                            }
                        }
                        None => notify.notified().await,
                    }
                }
            });
        }

        Ok(Self {
            queue,
            notify,
            capacity: capacity.max(1),
        })
    }

    /// Enqueue a record, dropping the oldest queued record on overflow.
    pub fn log(&self, record: AnalysisRecord) {
        {
            let mut q = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            if q.len() >= self.capacity {
                q.pop_front();
                debug!("[analysis] queue full, dropped oldest record");
            }
            q.push_back(record);
        }
        self.notify.notify_one();
    }

    pub fn log_emergency(&self, query: &str, severity: &str, keywords: Vec<String>, score: f64) {
        self.log(AnalysisRecord::Emergency {
            timestamp: Utc::now(),
            query: query.to_string(),
            severity: severity.to_string(),
            detected_keywords: keywords,
            score,
        });
    }

    pub fn log_safety_fallback(&self, query: &str, error_type: &str) {
        self.log(AnalysisRecord::SafetyFallback {
            timestamp: Utc::now(),
            query: query.to_string(),
            error_type: error_type.to_string(),
        });
    }

    pub fn log_low_citation(&self, query: &str, response: &str, citation_count: usize) {
        self.log(AnalysisRecord::LowCitation {
            timestamp: Utc::now(),
            query: query.chars().take(100).collect(),
            citation_count,
            response_length: response.len(),
            response_preview: preview(response),
        });
    }

    pub fn log_low_relevancy(
        &self,
        query: &str,
        response: &str,
        overlap: f64,
        missing_terms: Vec<String>,
    ) {
        self.log(AnalysisRecord::LowRelevancy {
            timestamp: Utc::now(),
            query: query.chars().take(100).collect(),
            overlap,
            missing_terms,
            response_preview: preview(response),
        });
    }

    pub fn log_hallucination(&self, query: &str, category: &str, claim: &str, confidence: f64) {
        self.log(AnalysisRecord::Hallucination {
            timestamp: Utc::now(),
            query: query.chars().take(100).collect(),
            category: category.to_string(),
            claim: claim.chars().take(200).collect(),
            confidence,
        });
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.log(AnalysisRecord::Flush(tx));
        let _ = rx.await;
    }
}

fn preview(response: &str) -> String {
    response.chars().take(200).collect::<String>().replace('\n', " ")
}

fn write_record(dir: &Path, record: &AnalysisRecord) -> Result<()> {
    let path = dir.join(record.file_name());
    let is_new = !path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::Storage(format!("Cannot open {}: {e}", path.display())))?;

    let mut writer = csv::Writer::from_writer(file);
    if is_new {
        writer
            .write_record(record.header())
            .map_err(|e| Error::Storage(format!("Cannot write header: {e}")))?;
    }
    writer
        .write_record(record.row())
        .map_err(|e| Error::Storage(format!("Cannot write record: {e}")))?;
    writer
        .flush()
        .map_err(|e| Error::Storage(format!("Cannot flush record: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emergency_rows_written_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnalysisLog::new(dir.path()).unwrap();
        log.log_emergency("shaking and confused", "CRITICAL", vec!["shaking".into()], 1.0);
        log.log_emergency("ketones high", "HIGH", vec!["ketones".into()], 0.5);
        log.flush().await;

        let raw = std::fs::read_to_string(dir.path().join("emergency_queries.csv")).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,query,severity_level"));
        assert!(lines[1].contains("shaking and confused"));
        assert!(lines[2].contains("HIGH"));
    }

    #[tokio::test]
    async fn test_each_sink_gets_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnalysisLog::new(dir.path()).unwrap();
        log.log_safety_fallback("how much insulin for 60g", "groq_error");
        log.log_low_citation("what is tir", "a long response", 0);
        log.log_low_relevancy("why spikes", "response", 0.2, vec!["spikes".into()]);
        log.log_hallucination("q", "numeric_claim", "70% of patients", 0.7);
        log.flush().await;

        for file in [
            "safety_fallback_log.csv",
            "low_citation_responses.csv",
            "low_relevancy_responses.csv",
            "hallucination_log.csv",
        ] {
            assert!(dir.path().join(file).exists(), "{file} missing");
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnalysisLog::with_capacity(dir.path(), 4).unwrap();
        // Saturate the queue faster than the writer can drain in practice;
        // correctness here only needs the queue-side invariant.
        for i in 0..100 {
            log.log_safety_fallback(&format!("q{i}"), "err");
        }
        let queued = log.queue.lock().unwrap().len();
        assert!(queued <= 4);
        log.flush().await;
    }

    #[tokio::test]
    async fn test_csv_escapes_embedded_commas() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnalysisLog::new(dir.path()).unwrap();
        log.log_safety_fallback("how much, insulin \"now\"", "timeout");
        log.flush().await;

        let raw = std::fs::read_to_string(dir.path().join("safety_fallback_log.csv")).unwrap();
        let mut reader = csv::Reader::from_reader(raw.as_bytes());
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[1], "how much, insulin \"now\"");
    }
}
