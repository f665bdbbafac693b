use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::config::{PhaseConfig, FAILED_STATE};

/// A maximal run of adjacent entities (in sorted order) sharing a numeric
/// prefix key. Concurrent iff the group has more than one entity and a key.
#[derive(Debug, Clone)]
pub struct Group {
    pub entities: Vec<PathBuf>,
    pub key: Option<String>,
}

impl Group {
    pub fn concurrent(&self) -> bool {
        self.key.is_some() && self.entities.len() > 1
    }
}

/// Owns the on-disk layout `<root>/<phase>/<state>/` and all entity listing,
/// grouping, and movement.
pub struct EntityStore {
    root: PathBuf,
    phase_state_dirs: HashMap<(String, String), PathBuf>,
    group_pattern: Regex,
}

impl EntityStore {
    pub fn new(root: PathBuf, phases: &[PhaseConfig]) -> Self {
        let mut phase_state_dirs = HashMap::new();
        for phase in phases {
            for state in &phase.states {
                phase_state_dirs.insert(
                    (phase.name.clone(), state.clone()),
                    root.join(&phase.name).join(state),
                );
            }
            phase_state_dirs.insert(
                (phase.name.clone(), FAILED_STATE.to_string()),
                root.join(&phase.name).join(FAILED_STATE),
            );
        }

        EntityStore {
            root,
            phase_state_dirs,
            group_pattern: Regex::new(r"^(\d+)-").expect("static pattern is valid"),
        }
    }

    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in self.phase_state_dirs.values() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn dir_for(&self, phase: &str, state: &str) -> &Path {
        self.phase_state_dirs
            .get(&(phase.to_string(), state.to_string()))
            .unwrap_or_else(|| panic!("unknown (phase, state) pair: ({}, {})", phase, state))
    }

    /// Moves `entity` into `<phase>/<state>/<basename>`. Renames within the
    /// same filesystem are atomic; a cross-device move degrades to
    /// copy+unlink via `std::fs::rename`'s own fallback behavior on some
    /// platforms, or is retried as copy+remove here if rename fails with
    /// `ErrorKind::CrossesDevices`-equivalent errors.
    pub async fn move_to_state(
        &self,
        phase: &str,
        state: &str,
        entity: PathBuf,
    ) -> std::io::Result<()> {
        let dest_dir = self.dir_for(phase, state).to_path_buf();
        let name = entity
            .file_name()
            .expect("entity path always has a file name")
            .to_owned();
        let destination = dest_dir.join(&name);

        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest_dir)?;
            match std::fs::rename(&entity, &destination) {
                Ok(()) => Ok(()),
                Err(_) => {
                    std::fs::copy(&entity, &destination)?;
                    std::fs::remove_file(&entity)
                }
            }
        })
        .await
        .expect("blocking move task does not panic")
    }

    pub async fn list_transition_entities(&self, phase: &str, source_state: &str) -> Vec<PathBuf> {
        self.list_entities(self.dir_for(phase, source_state)).await
    }

    /// Concatenates entries across every user state of the phase (in
    /// configured state order), excluding the reserved failure state, then
    /// sorts by (basename, parent-path).
    pub async fn list_phase_entities(&self, phase: &PhaseConfig) -> Vec<PathBuf> {
        let mut entities = Vec::new();
        for state in &phase.states {
            entities.extend(self.list_entities(self.dir_for(&phase.name, state)).await);
        }
        entities.sort_by(|a, b| {
            let name_a = a.file_name().unwrap_or_default();
            let name_b = b.file_name().unwrap_or_default();
            name_a
                .cmp(name_b)
                .then_with(|| a.parent().cmp(&b.parent()))
        });
        entities
    }

    /// A single forward scan: two adjacent entities belong to the same group
    /// iff both have a numeric-prefix key and the keys are equal. Entities
    /// without a key form singleton groups.
    pub fn group_entities(&self, entities: Vec<PathBuf>) -> Vec<Group> {
        let mut groups = Vec::new();
        let mut pending: Vec<PathBuf> = Vec::new();
        let mut pending_key: Option<String> = None;

        for entity in entities {
            let key = self.group_key(&entity);
            if pending.is_empty() {
                pending.push(entity);
                pending_key = key;
                continue;
            }
            if key.is_some() && key == pending_key {
                pending.push(entity);
                continue;
            }
            groups.push(Group {
                entities: std::mem::take(&mut pending),
                key: pending_key.take(),
            });
            pending.push(entity);
            pending_key = key;
        }

        if !pending.is_empty() {
            groups.push(Group {
                entities: pending,
                key: pending_key,
            });
        }
        groups
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_key(&self, entity: &Path) -> Option<String> {
        let name = entity.file_name()?.to_str()?;
        self.group_pattern
            .captures(name)
            .map(|caps| caps[1].to_string())
    }

    async fn list_entities(&self, source_dir: &Path) -> Vec<PathBuf> {
        let source_dir = source_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut entities: Vec<PathBuf> = match std::fs::read_dir(&source_dir) {
                Ok(read_dir) => read_dir
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().is_file())
                    .map(|entry| entry.path())
                    .collect(),
                Err(_) => Vec::new(),
            };
            entities.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
            entities
        })
        .await
        .expect("blocking listing task does not panic")
    }
}
