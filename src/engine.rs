use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::WorkflowConfig;
use crate::entities::EntityStore;
use crate::errors::{Result, WorkflowError};
use crate::hooks::HookRunner;
use crate::log_info;
use crate::phase_processor::{JumpHandler, PhaseProcessor};
use crate::state::StateStore;

/// Drives a whole workflow to completion: runs the init hook once, then
/// round-robins phases to fixpoint until a full lap starting from phase 0
/// produces zero moves.
pub struct WorkflowEngine {
    config: WorkflowConfig,
    entities: Arc<EntityStore>,
    hook_runner: Arc<HookRunner>,
    state: StateStore,
}

impl WorkflowEngine {
    pub fn new(
        config: WorkflowConfig,
        root: PathBuf,
        state_file: &str,
    ) -> Self {
        let entities = Arc::new(EntityStore::new(root.clone(), &config.phases));
        let mut defined_env = crate::config::directory_bindings(&config.phases, &root);
        defined_env.extend(config.environment.clone());
        let hook_runner = Arc::new(HookRunner::new(root.clone(), defined_env, config.retries));
        let state = StateStore::new(&root, state_file);

        WorkflowEngine {
            config,
            entities,
            hook_runner,
            state,
        }
    }

    pub async fn run(&self) -> Result<()> {
        self.entities.ensure_layout().map_err(|e| {
            WorkflowError::invalid(format!("Failed to create workflow directory layout: {}", e))
        })?;

        self.run_init().await?;

        let phase_order = self.config.phase_order();
        if phase_order.is_empty() {
            return Err(WorkflowError::invalid("Workflow has no phases to run"));
        }

        let starting_phase = self.state.load_current_phase()?;
        let mut index = match starting_phase {
            None => 0,
            Some(name) => phase_order
                .iter()
                .position(|p| *p == name)
                .ok_or_else(|| WorkflowError::UnknownPhase {
                    phase: name.clone(),
                    known: phase_order.join(", "),
                })?,
        };

        let mut wrapped_to_first = false;
        loop {
            let phase_name = phase_order[index].to_string();
            self.state.save_current_phase(&phase_name)?;

            let moved = self.run_phase_to_fixpoint(&phase_name).await?;

            if index == 0 {
                if wrapped_to_first && moved == 0 {
                    log_info!("Workflow reached global fixpoint at phase '{}'", phase_name);
                    return Ok(());
                }
                wrapped_to_first = true;
            }

            index = (index + 1) % phase_order.len();
        }
    }

    async fn run_init(&self) -> Result<()> {
        let Some(init) = &self.config.init else {
            return Ok(());
        };
        log_info!("Running init hook");
        let success = self
            .hook_runner
            .run(init, &BTreeMap::new(), "init hook")
            .await;
        if !success {
            return Err(WorkflowError::HookFailed {
                context: "init hook".to_string(),
            });
        }
        Ok(())
    }

    async fn run_phase_to_fixpoint(&self, phase_name: &str) -> Result<usize> {
        let phase_config = self
            .config
            .phases
            .iter()
            .find(|p| p.name == phase_name)
            .unwrap_or_else(|| panic!("phase '{}' vanished from workflow config", phase_name))
            .clone();

        let processor = PhaseProcessor::new(
            Arc::clone(&self.hook_runner),
            Arc::clone(&self.entities),
            phase_config,
        );
        processor.run_phase(self).await
    }
}

impl JumpHandler for WorkflowEngine {
    fn run_jump<'a>(
        &'a self,
        target_phase: &'a str,
        source_phase: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if target_phase == source_phase {
                log_info!(
                    "Phase '{}' jumps to itself; treating as a no-op",
                    source_phase
                );
                return Ok(());
            }

            if !self.config.phases.iter().any(|p| p.name == target_phase) {
                return Err(WorkflowError::UnknownPhase {
                    phase: target_phase.to_string(),
                    known: self.config.phase_order().join(", "),
                });
            }

            log_info!("Jumping from phase '{}' to phase '{}'", source_phase, target_phase);
            self.state.save_current_phase(target_phase)?;
            self.run_phase_to_fixpoint(target_phase).await?;

            log_info!("Returning from jump to phase '{}'", source_phase);
            self.state.save_current_phase(source_phase)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_workflow;

    fn engine_for(yaml: &str, root: PathBuf) -> WorkflowEngine {
        let config = load_workflow(yaml, &root).unwrap();
        WorkflowEngine::new(config, root, ".dirorch_runtime.json")
    }

    #[tokio::test]
    async fn test_single_phase_workflow_runs_to_fixpoint() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
phases:
  tasks:
    states: [new, done]
    transitions:
      - from: new
        to: done
"#;
        let engine = engine_for(yaml, dir.path().to_path_buf());
        std::fs::create_dir_all(dir.path().join("tasks/new")).unwrap();
        std::fs::write(dir.path().join("tasks/new/a.txt"), "").unwrap();

        engine.run().await.unwrap();

        assert!(dir.path().join("tasks/done/a.txt").exists());
    }

    #[tokio::test]
    async fn test_jump_round_trips_back_to_source_phase() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
phases:
  intake:
    states: [new, routed]
    transitions:
      - from: new
        to: routed
        jump: side
  side:
    states: [pending, done]
    transitions:
      - from: pending
        to: done
"#;
        let engine = engine_for(yaml, dir.path().to_path_buf());
        std::fs::create_dir_all(dir.path().join("intake/new")).unwrap();
        std::fs::create_dir_all(dir.path().join("side/pending")).unwrap();
        std::fs::write(dir.path().join("intake/new/a.txt"), "").unwrap();
        std::fs::write(dir.path().join("side/pending/b.txt"), "").unwrap();

        engine.run().await.unwrap();

        assert!(dir.path().join("intake/routed/a.txt").exists());
        assert!(dir.path().join("side/done/b.txt").exists());
    }

    #[tokio::test]
    async fn test_init_hook_failure_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
init: "exit 1"
phases:
  tasks:
    states: [new, done]
"#;
        let engine = engine_for(yaml, dir.path().to_path_buf());
        assert!(matches!(engine.run().await, Err(WorkflowError::HookFailed { .. })));
    }

    #[tokio::test]
    async fn test_resumes_from_persisted_current_phase() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
phases:
  first:
    states: [new, done]
  second:
    states: [new, done]
    transitions:
      - from: new
        to: done
"#;
        std::fs::write(
            dir.path().join(".dirorch_runtime.json"),
            r#"{"current_phase": "second"}"#,
        )
        .unwrap();
        let engine = engine_for(yaml, dir.path().to_path_buf());
        std::fs::create_dir_all(dir.path().join("second/new")).unwrap();
        std::fs::write(dir.path().join("second/new/a.txt"), "").unwrap();

        engine.run().await.unwrap();

        assert!(dir.path().join("second/done/a.txt").exists());
    }

    #[tokio::test]
    async fn test_unknown_persisted_phase_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
phases:
  tasks:
    states: [new, done]
"#;
        std::fs::write(
            dir.path().join(".dirorch_runtime.json"),
            r#"{"current_phase": "ghost"}"#,
        )
        .unwrap();
        let engine = engine_for(yaml, dir.path().to_path_buf());
        assert!(matches!(engine.run().await, Err(WorkflowError::UnknownPhase { .. })));
    }
}
