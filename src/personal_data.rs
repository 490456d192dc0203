//! Personal data collaborator contract.
//!
//! Device-export ingestion and statistics live outside the core; the
//! pipeline only consumes a pre-formatted text block (metrics, hourly
//! highs/lows, detected patterns, recommendations) or nothing at all.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;

/// Supplies the user's formatted personal-data context, if any is indexed.
#[async_trait]
pub trait PersonalDataLoader: Send + Sync {
    /// The formatted block, or `None` when no data has been ingested.
    async fn load(&self) -> Result<Option<String>>;
}

/// Loader over a pre-rendered context file written by the ingestion
/// collaborator.
pub struct FilePersonalDataLoader {
    path: PathBuf,
}

impl FilePersonalDataLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PersonalDataLoader for FilePersonalDataLoader {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(None),
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::error::Error::Storage(format!(
                "Cannot read personal data context: {e}"
            ))),
        }
    }
}

/// Loader that never has data. Used when ingestion is not configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersonalData;

#[async_trait]
impl PersonalDataLoader for NoPersonalData {
    async fn load(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let loader = FilePersonalDataLoader::new("/nonexistent/context.md");
        assert!(loader.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_contents_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.md");
        std::fs::write(&path, "TIR 68%\nDawn rise detected").unwrap();
        let loader = FilePersonalDataLoader::new(&path);
        let data = loader.load().await.unwrap().unwrap();
        assert!(data.contains("TIR 68%"));
    }

    #[tokio::test]
    async fn test_empty_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.md");
        std::fs::write(&path, "  \n").unwrap();
        let loader = FilePersonalDataLoader::new(&path);
        assert!(loader.load().await.unwrap().is_none());
    }
}
