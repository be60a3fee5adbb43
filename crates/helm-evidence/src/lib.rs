//! EvidencePack directory assembler (§4.13): lays out the fixed numbered
//! directory tree, walks it to build `00_INDEX.json`, and structurally
//! validates a pack against the mandatory set plus declared extensions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MANDATORY_DIRS: &[&str] = &[
    "02_PROOFGRAPH",
    "03_TELEMETRY",
    "04_EXPORTS",
    "05_DIFFS",
    "06_LOGS",
    "07_ATTESTATIONS",
    "08_TAPES",
    "09_SCHEMAS",
    "10_A2A",
    "11_FORMAL",
    "12_REPORTS",
];

pub const MANDATORY_FILES: &[&str] = &["00_INDEX.json", "01_SCORE.json"];

const EXTENSIONS_DIR: &str = "99_EXT";

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub schema_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    pub files: Vec<IndexEntry>,
    pub topo_order_rule: String,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub missing_dirs: Vec<String>,
    pub missing_files: Vec<String>,
    pub undeclared_extensions: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.missing_dirs.is_empty() && self.missing_files.is_empty() && self.undeclared_extensions.is_empty()
    }
}

pub struct EvidencePackAssembler {
    pub root: PathBuf,
}

fn io_err(path: &Path, source: std::io::Error) -> EvidenceError {
    EvidenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn content_type_for(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("jsonl") => "application/x-ndjson",
        Some("sig") => "application/octet-stream",
        Some("bin") => "application/octet-stream",
        _ => "application/octet-stream",
    }
    .to_string()
}

impl EvidencePackAssembler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the fixed directory skeleton. Idempotent.
    pub async fn initialize(&self) -> Result<(), EvidenceError> {
        for dir in MANDATORY_DIRS {
            let path = self.root.join(dir);
            tokio::fs::create_dir_all(&path).await.map_err(|e| io_err(&path, e))?;
        }
        Ok(())
    }

    /// Create `99_EXT/<vendor>/` for a declared extension.
    pub async fn register_extension(&self, vendor: &str) -> Result<(), EvidenceError> {
        let path = self.root.join(EXTENSIONS_DIR).join(vendor);
        tokio::fs::create_dir_all(&path).await.map_err(|e| io_err(&path, e))
    }

    /// Walk every file under the pack root (excluding `00_INDEX.json`
    /// itself) and hash it, producing the document that becomes that file.
    pub async fn build_index(&self, extensions: Vec<String>) -> Result<IndexDocument, EvidenceError> {
        let root = self.root.clone();
        let index_path = root.join("00_INDEX.json");
        let mut files = Vec::new();

        for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path() == index_path {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await.map_err(|e| io_err(entry.path(), e))?;
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            files.push(IndexEntry {
                path: relative,
                sha256: helm_canon::sha256_hex(&bytes),
                size_bytes: bytes.len() as u64,
                content_type: content_type_for(entry.path()),
                schema_version: None,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(IndexDocument {
            files,
            topo_order_rule: "seq_monotonic_dag".to_string(),
            extensions,
        })
    }

    pub async fn write_index(&self, index: &IndexDocument) -> Result<(), EvidenceError> {
        let path = self.root.join("00_INDEX.json");
        let bytes = serde_json::to_vec_pretty(index)?;
        tokio::fs::write(&path, bytes).await.map_err(|e| io_err(&path, e))
    }

    /// Structural validation: mandatory dirs/files present, and every
    /// subdirectory of `99_EXT` is one of `00_INDEX.json`'s declared
    /// `extensions`.
    pub async fn validate_structure(&self) -> Result<ValidationReport, EvidenceError> {
        let mut report = ValidationReport::default();

        for dir in MANDATORY_DIRS {
            if !self.root.join(dir).is_dir() {
                report.missing_dirs.push(dir.to_string());
            }
        }
        for file in MANDATORY_FILES {
            if !self.root.join(file).is_file() {
                report.missing_files.push(file.to_string());
            }
        }

        let declared: Vec<String> = match tokio::fs::read(self.root.join("00_INDEX.json")).await {
            Ok(bytes) => serde_json::from_slice::<IndexDocument>(&bytes).map(|d| d.extensions).unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        let ext_dir = self.root.join(EXTENSIONS_DIR);
        if ext_dir.is_dir() {
            let mut entries = tokio::fs::read_dir(&ext_dir).await.map_err(|e| io_err(&ext_dir, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&ext_dir, e))? {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !declared.contains(&name) {
                        report.undeclared_extensions.push(name);
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_then_validate_reports_missing_score_file() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = EvidencePackAssembler::new(dir.path());
        assembler.initialize().await.unwrap();
        let report = assembler.validate_structure().await.unwrap();
        assert!(report.missing_dirs.is_empty());
        assert_eq!(report.missing_files, vec!["00_INDEX.json", "01_SCORE.json"]);
    }

    #[tokio::test]
    async fn index_hashes_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = EvidencePackAssembler::new(dir.path());
        assembler.initialize().await.unwrap();
        tokio::fs::write(dir.path().join("02_PROOFGRAPH").join("r1.json"), b"{}")
            .await
            .unwrap();
        let index = assembler.build_index(Vec::new()).await.unwrap();
        assert_eq!(index.files.len(), 1);
        assert!(index.files[0].sha256.starts_with("sha256:"));
        assert_eq!(index.topo_order_rule, "seq_monotonic_dag");
    }

    #[tokio::test]
    async fn undeclared_extension_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = EvidencePackAssembler::new(dir.path());
        assembler.initialize().await.unwrap();
        assembler.register_extension("acme").await.unwrap();
        let index = assembler.build_index(Vec::new()).await.unwrap();
        assembler.write_index(&index).await.unwrap();
        let report = assembler.validate_structure().await.unwrap();
        assert_eq!(report.undeclared_extensions, vec!["acme".to_string()]);
    }

    #[tokio::test]
    async fn declared_extension_is_not_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = EvidencePackAssembler::new(dir.path());
        assembler.initialize().await.unwrap();
        assembler.register_extension("acme").await.unwrap();
        let index = assembler.build_index(vec!["acme".to_string()]).await.unwrap();
        assembler.write_index(&index).await.unwrap();
        let report = assembler.validate_structure().await.unwrap();
        assert!(report.undeclared_extensions.is_empty());
    }
}
