use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config::{HookConfig, PhaseConfig, PhaseMode, TransitionConfig, FAILED_STATE};
use crate::entities::{EntityStore, Group};
use crate::errors::{Result, WorkflowError};
use crate::hooks::HookRunner;
use crate::{log_info, log_warn};

/// Outcome of driving one entity through one transition.
#[derive(Debug, Clone)]
pub struct TransitionResult {
    pub moved: bool,
    pub jump: Option<String>,
}

/// Callback into the owning `WorkflowEngine` for cross-phase jumps. Modeled
/// as a boxed-future trait rather than a plain async closure so
/// `PhaseProcessor` never back-points to the engine that owns it.
pub trait JumpHandler: Sync {
    fn run_jump<'a>(
        &'a self,
        target_phase: &'a str,
        source_phase: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Runs a single phase to a fixpoint, independent of global phase scheduling.
/// Picks between the Batch and PerEntity disciplines based on `config.mode`.
pub struct PhaseProcessor {
    hook_runner: Arc<HookRunner>,
    entities: Arc<EntityStore>,
    config: PhaseConfig,
}

impl PhaseProcessor {
    pub fn new(hook_runner: Arc<HookRunner>, entities: Arc<EntityStore>, config: PhaseConfig) -> Self {
        PhaseProcessor {
            hook_runner,
            entities,
            config,
        }
    }

    pub async fn run_phase(&self, jump_handler: &dyn JumpHandler) -> Result<usize> {
        log_info!(
            "Processing phase '{}' (mode: {})",
            self.config.name,
            mode_label(&self.config.mode)
        );
        let moved_total = match self.config.mode {
            PhaseMode::Batch => self.run_batch(jump_handler).await?,
            PhaseMode::PerEntity => self.run_per_entity(jump_handler).await?,
        };
        self.run_completions().await?;
        log_info!(
            "Phase '{}' reached fixpoint; transitions={}",
            self.config.name,
            moved_total
        );
        Ok(moved_total)
    }

    async fn run_completions(&self) -> Result<()> {
        for (index, hook) in self.config.completions.iter().enumerate() {
            let context = format!("completion hook {}[{}]", self.config.name, index + 1);
            log_info!("Running {}", context);
            let success = self
                .hook_runner
                .run(hook, &Default::default(), &context)
                .await;
            if !success {
                return Err(WorkflowError::HookFailed { context });
            }
        }
        Ok(())
    }

    async fn process_entity(&self, transition: &TransitionConfig, entity: PathBuf) -> TransitionResult {
        if !entity.exists() {
            return TransitionResult {
                moved: false,
                jump: None,
            };
        }

        let context = format!(
            "transition hook {}:{}->{} entity={}",
            self.config.name,
            transition.source,
            transition.destination,
            entity.file_name().and_then(|n| n.to_str()).unwrap_or("?"),
        );

        let mut extra_env = std::collections::BTreeMap::new();
        let absolute = entity
            .canonicalize()
            .unwrap_or_else(|_| entity.clone());
        extra_env.insert("INPUT_ENTITY".to_string(), absolute.display().to_string());

        let success = match &transition.cmd {
            None => true,
            Some(cmd) => {
                let hook = HookConfig {
                    cmd: cmd.clone(),
                    stdin: transition.stdin.clone(),
                };
                self.hook_runner.run(&hook, &extra_env, &context).await
            }
        };

        if success {
            let name = entity.file_name().and_then(|n| n.to_str()).unwrap_or("?").to_string();
            if let Err(e) = self
                .entities
                .move_to_state(&self.config.name, &transition.destination, entity)
                .await
            {
                log_info!(
                    "Failed to move entity '{}' to {}/{}: {}",
                    name,
                    self.config.name,
                    transition.destination,
                    e
                );
            } else {
                log_info!(
                    "Moved entity '{}' to {}/{}",
                    name,
                    self.config.name,
                    transition.destination
                );
            }
            TransitionResult {
                moved: true,
                jump: transition.jump.clone(),
            }
        } else {
            let name = entity.file_name().and_then(|n| n.to_str()).unwrap_or("?").to_string();
            let _ = self
                .entities
                .move_to_state(&self.config.name, FAILED_STATE, entity)
                .await;
            log_info!(
                "Transition failed for '{}'; moved to {}/{}",
                name,
                self.config.name,
                FAILED_STATE
            );
            TransitionResult {
                moved: false,
                jump: None,
            }
        }
    }

    // --- Batch mode ---

    async fn run_batch(&self, jump_handler: &dyn JumpHandler) -> Result<usize> {
        let mut moved_total = 0usize;
        loop {
            let mut moved_this_pass = 0usize;
            for transition in &self.config.transitions {
                let (moved, jumps) = self.apply_transition(transition).await;
                moved_this_pass += moved;
                moved_total += moved;
                for jump_name in jumps {
                    jump_handler.run_jump(&jump_name, &self.config.name).await?;
                }
            }
            if moved_this_pass == 0 {
                return Ok(moved_total);
            }
        }
    }

    async fn apply_transition(&self, transition: &TransitionConfig) -> (usize, Vec<String>) {
        let entities = self
            .entities
            .list_transition_entities(&self.config.name, &transition.source)
            .await;
        if entities.is_empty() {
            return (0, Vec::new());
        }

        let mut moved = 0usize;
        let mut jumps = Vec::new();
        for group in self.entities.group_entities(entities) {
            let results = self.process_group(transition, group).await;
            for result in results {
                if result.moved {
                    moved += 1;
                    if let Some(jump) = result.jump {
                        jumps.push(jump);
                    }
                }
            }
        }
        (moved, jumps)
    }

    async fn process_group(&self, transition: &TransitionConfig, group: Group) -> Vec<TransitionResult> {
        if group.concurrent() {
            log_info!(
                "Running transition {}.{} -> {} for {} concurrent entities (group={})",
                self.config.name,
                transition.source,
                transition.destination,
                group.entities.len(),
                group.key.as_deref().unwrap_or("?"),
            );

            let mut join_set: JoinSet<TransitionResult> = JoinSet::new();
            for entity in group.entities {
                let hook_runner = Arc::clone(&self.hook_runner);
                let entity_store = Arc::clone(&self.entities);
                let transition = transition.clone();
                let phase_name = self.config.name.clone();
                join_set.spawn(async move {
                    let processor = PhaseProcessor {
                        hook_runner,
                        entities: entity_store,
                        config: PhaseConfig {
                            name: phase_name,
                            states: Vec::new(),
                            transitions: Vec::new(),
                            completions: Vec::new(),
                            mode: PhaseMode::Batch,
                        },
                    };
                    processor.process_entity(&transition, entity).await
                });
            }

            let mut results = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        log_warn!(
                            "Concurrent entity task in phase '{}' transition {}->{} failed to join: {}",
                            self.config.name,
                            transition.source,
                            transition.destination,
                            e
                        );
                    }
                }
            }
            results
        } else {
            let mut results = Vec::with_capacity(group.entities.len());
            for entity in group.entities {
                results.push(self.process_entity(transition, entity).await);
            }
            results
        }
    }

    // --- PerEntity mode ---

    async fn run_per_entity(&self, jump_handler: &dyn JumpHandler) -> Result<usize> {
        let mut moved_total = 0usize;
        loop {
            let mut moved_this_pass = 0usize;
            for entity in self.entities.list_phase_entities(&self.config).await {
                moved_this_pass += self.flow_entity_to_rest(entity, jump_handler).await?;
            }
            if moved_this_pass == 0 {
                return Ok(moved_total + moved_this_pass);
            }
            moved_total += moved_this_pass;
        }
    }

    async fn flow_entity_to_rest(
        &self,
        entity: PathBuf,
        jump_handler: &dyn JumpHandler,
    ) -> Result<usize> {
        if !entity.exists() {
            return Ok(0);
        }

        let mut moved = 0usize;
        let mut current = entity;
        loop {
            let state_name = current
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string();
            let Some(transition) = find_transition_from_state(&self.config, &state_name) else {
                return Ok(moved);
            };

            let result = self.process_entity(transition, current.clone()).await;
            if !result.moved {
                return Ok(moved);
            }
            moved += 1;

            let name = current.file_name().expect("entity has a file name").to_owned();
            current = self
                .entities
                .dir_for(&self.config.name, &transition.destination)
                .join(&name);

            if let Some(jump) = result.jump {
                jump_handler.run_jump(&jump, &self.config.name).await?;
            }
        }
    }
}

fn find_transition_from_state<'a>(phase: &'a PhaseConfig, state_name: &str) -> Option<&'a TransitionConfig> {
    phase.transitions.iter().find(|t| t.source == state_name)
}

fn mode_label(mode: &PhaseMode) -> &'static str {
    match mode {
        PhaseMode::Batch => "transitions",
        PhaseMode::PerEntity => "entity",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseMode;
    use std::collections::BTreeMap;

    struct NoopJumpHandler;
    impl JumpHandler for NoopJumpHandler {
        fn run_jump<'a>(
            &'a self,
            _target_phase: &'a str,
            _source_phase: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn make_phase(name: &str, states: &[&str], transitions: Vec<TransitionConfig>) -> PhaseConfig {
        PhaseConfig {
            name: name.to_string(),
            states: states.iter().map(|s| s.to_string()).collect(),
            transitions,
            completions: Vec::new(),
            mode: PhaseMode::Batch,
        }
    }

    #[tokio::test]
    async fn test_simple_transition_moves_entities_to_destination() {
        let dir = tempfile::tempdir().unwrap();
        let transitions = vec![TransitionConfig {
            source: "new".to_string(),
            destination: "done".to_string(),
            cmd: None,
            stdin: None,
            jump: None,
        }];
        let phase = make_phase("tasks", &["new", "done"], transitions);
        let entities = Arc::new(EntityStore::new(dir.path().to_path_buf(), &[phase.clone()]));
        entities.ensure_layout().unwrap();
        std::fs::write(dir.path().join("tasks/new/a.txt"), "").unwrap();
        std::fs::write(dir.path().join("tasks/new/b.txt"), "").unwrap();

        let hook_runner = Arc::new(HookRunner::new(
            dir.path().to_path_buf(),
            BTreeMap::new(),
            0,
        ));
        let processor = PhaseProcessor::new(hook_runner, entities, phase);
        let moved = processor.run_phase(&NoopJumpHandler).await.unwrap();

        assert_eq!(moved, 2);
        assert!(dir.path().join("tasks/done/a.txt").exists());
        assert!(dir.path().join("tasks/done/b.txt").exists());
    }

    #[tokio::test]
    async fn test_failing_transition_routes_to_failed_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let transitions = vec![TransitionConfig {
            source: "new".to_string(),
            destination: "done".to_string(),
            cmd: Some("exit 2".to_string()),
            stdin: None,
            jump: None,
        }];
        let phase = make_phase("tasks", &["new", "done"], transitions);
        let entities = Arc::new(EntityStore::new(dir.path().to_path_buf(), &[phase.clone()]));
        entities.ensure_layout().unwrap();
        std::fs::write(dir.path().join("tasks/new/bad.txt"), "").unwrap();

        let hook_runner = Arc::new(HookRunner::new(
            dir.path().to_path_buf(),
            BTreeMap::new(),
            1,
        ));
        let processor = PhaseProcessor::new(hook_runner, entities, phase);
        processor.run_phase(&NoopJumpHandler).await.unwrap();

        assert!(dir.path().join("tasks/_failed/bad.txt").exists());
        assert!(!dir.path().join("tasks/done/bad.txt").exists());
    }

    #[tokio::test]
    async fn test_per_entity_mode_flows_one_entity_through_multiple_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let transitions = vec![
            TransitionConfig {
                source: "new".to_string(),
                destination: "mid".to_string(),
                cmd: None,
                stdin: None,
                jump: None,
            },
            TransitionConfig {
                source: "mid".to_string(),
                destination: "done".to_string(),
                cmd: None,
                stdin: None,
                jump: None,
            },
        ];
        let mut phase = make_phase("tasks", &["new", "mid", "done"], transitions);
        phase.mode = PhaseMode::PerEntity;
        let entities = Arc::new(EntityStore::new(dir.path().to_path_buf(), &[phase.clone()]));
        entities.ensure_layout().unwrap();
        std::fs::write(dir.path().join("tasks/new/a.txt"), "").unwrap();

        let hook_runner = Arc::new(HookRunner::new(
            dir.path().to_path_buf(),
            BTreeMap::new(),
            0,
        ));
        let processor = PhaseProcessor::new(hook_runner, entities, phase);
        let moved = processor.run_phase(&NoopJumpHandler).await.unwrap();

        assert_eq!(moved, 2);
        assert!(dir.path().join("tasks/done/a.txt").exists());
    }

    #[tokio::test]
    async fn test_completion_hook_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut phase = make_phase("tasks", &["new"], Vec::new());
        phase.completions = vec![HookConfig {
            cmd: "exit 1".to_string(),
            stdin: None,
        }];
        let entities = Arc::new(EntityStore::new(dir.path().to_path_buf(), &[phase.clone()]));
        entities.ensure_layout().unwrap();

        let hook_runner = Arc::new(HookRunner::new(
            dir.path().to_path_buf(),
            BTreeMap::new(),
            0,
        ));
        let processor = PhaseProcessor::new(hook_runner, entities, phase);
        assert!(matches!(
            processor.run_phase(&NoopJumpHandler).await,
            Err(WorkflowError::HookFailed { .. })
        ));
    }
}
