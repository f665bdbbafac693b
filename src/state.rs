use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::WorkflowError;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    current_phase: Option<serde_json::Value>,
}

/// Persists the name of the phase currently owning execution to a small JSON
/// file under the workflow root, so an interrupted run can resume where it
/// left off.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(root: &Path, state_file: &str) -> Self {
        StateStore {
            path: root.join(state_file),
        }
    }

    /// Returns `Ok(None)` if the file is absent or has no `current_phase`
    /// key. Fails with `CorruptState` if the JSON is malformed or
    /// `current_phase` is present but not a string.
    pub fn load_current_phase(&self) -> Result<Option<String>, WorkflowError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(WorkflowError::CorruptState {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        let parsed: PersistedState =
            serde_json::from_str(&raw).map_err(|e| WorkflowError::CorruptState {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        match parsed.current_phase {
            None => Ok(None),
            Some(serde_json::Value::String(name)) => Ok(Some(name)),
            Some(_) => Err(WorkflowError::CorruptState {
                path: self.path.clone(),
                reason: "'current_phase' is present but not a string".to_string(),
            }),
        }
    }

    /// Writes `{"current_phase": name}` pretty-printed, overwriting
    /// unconditionally. Written via write-to-temp-then-rename in the same
    /// directory so a crash mid-write cannot leave a half-written file behind
    /// -- the rename is free and the on-disk format is unchanged.
    pub fn save_current_phase(&self, name: &str) -> Result<(), WorkflowError> {
        let payload = serde_json::json!({ "current_phase": name });
        let body = serde_json::to_string_pretty(&payload).expect("json object always serializes");

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("dirorch_state")
        ));

        std::fs::write(&tmp_path, body).map_err(|e| WorkflowError::CorruptState {
            path: self.path.clone(),
            reason: format!("failed to write state: {}", e),
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| WorkflowError::CorruptState {
            path: self.path.clone(),
            reason: format!("failed to persist state: {}", e),
        })?;
        Ok(())
    }
}
