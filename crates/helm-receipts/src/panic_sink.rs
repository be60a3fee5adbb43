//! The panic sink: an immutable log independent of the receipt pipeline
//! where emission failures are recorded, per `spec.md` §4.8.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanicRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub tenant_id: String,
    pub reason: String,
    pub last_good_seq: u64,
    pub error_detail: String,
}

/// Atomically write `record` to `06_LOGS/receipt_emission_panic.json` under
/// `evidence_root`, via write-temp-then-rename.
pub fn write_panic_record(evidence_root: &Path, record: &PanicRecord) -> std::io::Result<PathBuf> {
    let dir = evidence_root.join("06_LOGS");
    std::fs::create_dir_all(&dir)?;
    let target = dir.join("receipt_emission_panic.json");
    let tmp = dir.join("receipt_emission_panic.json.tmp");
    let bytes = serde_json::to_vec_pretty(record).expect("PanicRecord always serializes");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, &target)?;
    Ok(target)
}

/// Read back a previously written panic record, if any exists.
pub fn read_panic_record(evidence_root: &Path) -> std::io::Result<Option<PanicRecord>> {
    let path = evidence_root.join("06_LOGS").join("receipt_emission_panic.json");
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path)?;
    let record = serde_json::from_slice(&bytes)?;
    Ok(Some(record))
}
