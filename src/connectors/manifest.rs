//! `.metadata.json` written next to downloaded files
//!
//! A JSON object keyed by canonical target key, one entry per resolved URL:
//! `{"<key>": {"filename", "url", "success", "from_dataset"}}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::engine::{DownloadOutcome, ProgressLedger};
use crate::error::{Result, RunError};

pub const MANIFEST_FILE: &str = ".metadata.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, DownloadOutcome>,
}

impl Manifest {
    pub fn from_ledger(ledger: &ProgressLedger) -> Self {
        let entries = ledger
            .outcomes()
            .iter()
            .map(|(key, outcome)| (key.to_string(), outcome.clone()))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&DownloadOutcome> {
        self.entries.get(key)
    }

    pub fn successes(&self) -> u64 {
        self.entries.values().filter(|e| e.success).count() as u64
    }

    /// Write into `dir`, returning the manifest path
    pub async fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        let body = serde_json::to_vec(self).map_err(|source| RunError::Serialize {
            what: "manifest",
            source,
        })?;

        tokio::fs::write(&path, body)
            .await
            .map_err(|e| RunError::io(&path, e))?;
        Ok(path)
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| RunError::io(path, e))?;
        serde_json::from_slice(&body).map_err(|source| RunError::Serialize {
            what: "manifest",
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CanonicalKey, LedgerEvent};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_manifest_written_from_ledger() {
        let mut ledger = ProgressLedger::new(0);
        for (name, success) in [("a.png", true), ("b.png", false)] {
            let url = format!("https://cdn.example/{}", name);
            ledger.record(LedgerEvent::Download {
                key: CanonicalKey::for_url(&url).unwrap(),
                outcome: DownloadOutcome {
                    filename: name.to_string(),
                    url,
                    success,
                    from_dataset: "ds-42".to_string(),
                },
            });
        }

        let dir = TempDir::new().unwrap();
        let manifest = Manifest::from_ledger(&ledger);
        let path = manifest.write(dir.path()).await.unwrap();
        assert!(path.ends_with(MANIFEST_FILE));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let entry = &raw["https://cdn.example/a.png"];
        assert_eq!(entry["filename"], "a.png");
        assert_eq!(entry["success"], true);
        assert_eq!(entry["from_dataset"], "ds-42");

        let reread = Manifest::read(&path).await.unwrap();
        assert_eq!(reread, manifest);
        assert_eq!(reread.successes(), 1);
    }
}
