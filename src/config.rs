use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::errors::WorkflowError;
use crate::template::TemplateRenderer;

/// Reserved per-phase bucket receiving entities whose transition hook
/// exhausted its retries. Cannot be declared as a user state.
pub const FAILED_STATE: &str = "_failed";

pub const PHASE_MODE_TRANSITIONS: &str = "transitions";
pub const PHASE_MODE_ENTITY: &str = "entity";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseMode {
    Batch,
    PerEntity,
}

#[derive(Debug, Clone)]
pub struct HookConfig {
    pub cmd: String,
    pub stdin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransitionConfig {
    pub source: String,
    pub destination: String,
    pub cmd: Option<String>,
    pub stdin: Option<String>,
    pub jump: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub name: String,
    pub states: Vec<String>,
    pub transitions: Vec<TransitionConfig>,
    pub completions: Vec<HookConfig>,
    pub mode: PhaseMode,
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub phases: Vec<PhaseConfig>,
    /// Final, rendered environment -- ready to merge into every hook's base env.
    pub environment: BTreeMap<String, String>,
    pub retries: u32,
    pub init: Option<HookConfig>,
}

impl WorkflowConfig {
    pub fn phase_order(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Loads and validates a workflow definition from YAML text, then renders its
/// `env` templates against the directory bindings derived from `root`.
pub fn load_workflow(yaml_text: &str, root: &std::path::Path) -> Result<WorkflowConfig, WorkflowError> {
    let raw: RawDocument = serde_yaml::from_str(yaml_text)
        .map_err(|e| WorkflowError::invalid(format!("Invalid YAML: {}", e)))?;

    if raw.phases.is_empty() {
        return Err(WorkflowError::invalid(
            "Workflow must include non-empty 'phases' mapping",
        ));
    }

    let retries = raw.retries.unwrap_or(3);
    let init = raw
        .init
        .map(|h| parse_hook(h, "'init'"))
        .transpose()?;
    let phases = parse_phases(raw.phases)?;
    validate_workflow(&phases)?;

    let raw_env = raw.env.or(raw.environment).unwrap_or_default();
    let bindings = directory_bindings(&phases, root);
    let environment = render_environment(raw_env, &bindings, root)?;

    Ok(WorkflowConfig {
        phases,
        environment,
        retries,
        init,
    })
}

/// Directory bindings exposed to every hook and to env-template rendering:
/// `DIR_<sanitize(phase)>_<sanitize(state)>` -> absolute path of that state
/// directory. The reserved `_failed` bucket is never exposed as a binding.
pub fn directory_bindings(
    phases: &[PhaseConfig],
    root: &std::path::Path,
) -> BTreeMap<String, String> {
    let mut bindings = BTreeMap::new();
    for phase in phases {
        for state in &phase.states {
            let key = format!("DIR_{}_{}", sanitize_token(&phase.name), sanitize_token(state));
            let path = root.join(&phase.name).join(state);
            bindings.insert(key, path.display().to_string());
        }
    }
    bindings
}

fn sanitize_token(s: &str) -> String {
    s.to_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Progressive-rounds rendering of workflow `env` templates. Each round
/// attempts every unresolved entry against (directory bindings ∪ already
/// rendered entries); entries that succeed are promoted into the context for
/// the next round. Fails with `InvalidWorkflow` if a round makes no progress
/// -- this is how mutual-dependency cycles are caught. The process
/// environment and `INPUT_ENTITY` are never part of the context.
fn render_environment(
    raw_env: IndexMap<String, String>,
    bindings: &BTreeMap<String, String>,
    root: &std::path::Path,
) -> Result<BTreeMap<String, String>, WorkflowError> {
    let renderer = TemplateRenderer::new(root);
    let mut resolved: BTreeMap<String, String> = bindings.clone();
    let mut pending: Vec<(String, String)> = raw_env.into_iter().collect();

    while !pending.is_empty() {
        let mut next_pending = Vec::new();
        let mut progressed = false;

        for (name, template) in pending {
            match renderer.render(&template, &resolved) {
                Ok(value) => {
                    resolved.insert(name, value);
                    progressed = true;
                }
                Err(_) => next_pending.push((name, template)),
            }
        }

        if !progressed {
            let names: Vec<&str> = next_pending.iter().map(|(n, _)| n.as_str()).collect();
            return Err(WorkflowError::invalid(format!(
                "Could not resolve env entries (cycle or unknown reference): {}",
                names.join(", ")
            )));
        }
        pending = next_pending;
    }

    // Directory bindings were only scaffolding for rendering; strip them back
    // out so the workflow's own `env` names are all that remain.
    for key in bindings.keys() {
        resolved.remove(key);
    }
    Ok(resolved)
}

// --- Raw YAML shapes ---

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    phases: IndexMap<String, RawPhase>,
    #[serde(default)]
    env: Option<IndexMap<String, String>>,
    #[serde(default)]
    environment: Option<IndexMap<String, String>>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    init: Option<RawHook>,
}

#[derive(Debug, Deserialize)]
struct RawPhase {
    #[serde(default)]
    states: Vec<String>,
    #[serde(default)]
    transitions: Vec<RawTransition>,
    #[serde(default)]
    completions: Option<Vec<RawHook>>,
    #[serde(default)]
    completion: Option<Vec<RawHook>>,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTransition {
    from: Option<String>,
    to: Option<String>,
    cmd: Option<String>,
    stdin: Option<String>,
    jump: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawHook {
    Cmd(String),
    Full { cmd: Option<String>, stdin: Option<String> },
}

fn parse_hook(raw: RawHook, field_name: &str) -> Result<HookConfig, WorkflowError> {
    let (cmd, stdin) = match raw {
        RawHook::Cmd(cmd) => (Some(cmd), None),
        RawHook::Full { cmd, stdin } => (cmd, stdin),
    };
    let cmd = cmd.filter(|c| !c.trim().is_empty()).ok_or_else(|| {
        WorkflowError::invalid(format!("{} must be a string or a mapping with 'cmd'", field_name))
    })?;
    Ok(HookConfig { cmd, stdin })
}

fn parse_phases(raw_phases: IndexMap<String, RawPhase>) -> Result<Vec<PhaseConfig>, WorkflowError> {
    let mut phases = Vec::new();
    for (name, raw_phase) in raw_phases {
        if name.is_empty() {
            return Err(WorkflowError::invalid("Phase names must be non-empty strings"));
        }

        let states = parse_states(&name, raw_phase.states)?;
        let transitions = parse_transitions(&name, raw_phase.transitions)?;
        let completions = parse_completions(&name, raw_phase.completions.or(raw_phase.completion))?;
        let mode = parse_phase_mode(&name, raw_phase.mode)?;

        phases.push(PhaseConfig {
            name,
            states,
            transitions,
            completions,
            mode,
        });
    }
    Ok(phases)
}

fn parse_states(phase_name: &str, raw_states: Vec<String>) -> Result<Vec<String>, WorkflowError> {
    if raw_states.is_empty() {
        return Err(WorkflowError::invalid(format!(
            "Phase '{}' must include non-empty 'states' list",
            phase_name
        )));
    }

    let mut states = Vec::new();
    for state in raw_states {
        if state.is_empty() {
            return Err(WorkflowError::invalid(format!(
                "Phase '{}' contains invalid state name",
                phase_name
            )));
        }
        if state == FAILED_STATE {
            return Err(WorkflowError::invalid(format!(
                "Phase '{}' cannot include reserved state '{}' in 'states'",
                phase_name, FAILED_STATE
            )));
        }
        if states.contains(&state) {
            return Err(WorkflowError::invalid(format!(
                "Phase '{}' has duplicate state '{}'",
                phase_name, state
            )));
        }
        states.push(state);
    }
    Ok(states)
}

fn parse_transitions(
    phase_name: &str,
    raw_transitions: Vec<RawTransition>,
) -> Result<Vec<TransitionConfig>, WorkflowError> {
    let mut transitions = Vec::new();
    for item in raw_transitions {
        let source = item.from.filter(|s| !s.is_empty()).ok_or_else(|| {
            WorkflowError::invalid(format!("Phase '{}' transition is missing valid 'from'", phase_name))
        })?;
        let destination = item.to.filter(|s| !s.is_empty()).ok_or_else(|| {
            WorkflowError::invalid(format!("Phase '{}' transition is missing valid 'to'", phase_name))
        })?;

        if let Some(cmd) = &item.cmd {
            if cmd.trim().is_empty() {
                return Err(WorkflowError::invalid(format!(
                    "Phase '{}' transition '{}->{}' has invalid 'cmd'",
                    phase_name, source, destination
                )));
            }
        }
        if item.cmd.is_none() && item.stdin.is_some() {
            return Err(WorkflowError::invalid(format!(
                "Phase '{}' transition '{}->{}' requires 'cmd' when 'stdin' is set",
                phase_name, source, destination
            )));
        }
        if let Some(jump) = &item.jump {
            if jump.is_empty() {
                return Err(WorkflowError::invalid(format!(
                    "Phase '{}' transition '{}->{}' has invalid 'jump'",
                    phase_name, source, destination
                )));
            }
        }

        transitions.push(TransitionConfig {
            source,
            destination,
            cmd: item.cmd,
            stdin: item.stdin,
            jump: item.jump,
        });
    }
    Ok(transitions)
}

fn parse_completions(
    phase_name: &str,
    raw_completions: Option<Vec<RawHook>>,
) -> Result<Vec<HookConfig>, WorkflowError> {
    let Some(raw_completions) = raw_completions else {
        return Ok(Vec::new());
    };
    raw_completions
        .into_iter()
        .map(|item| {
            parse_hook(item, "completion hook").map_err(|_| {
                WorkflowError::invalid(format!(
                    "Phase '{}' completion entries must be strings or mappings",
                    phase_name
                ))
            })
        })
        .collect()
}

fn parse_phase_mode(phase_name: &str, raw_mode: Option<String>) -> Result<PhaseMode, WorkflowError> {
    let mode = raw_mode.unwrap_or_else(|| PHASE_MODE_TRANSITIONS.to_string());
    match mode.trim().to_lowercase().as_str() {
        PHASE_MODE_TRANSITIONS => Ok(PhaseMode::Batch),
        PHASE_MODE_ENTITY => Ok(PhaseMode::PerEntity),
        other => Err(WorkflowError::invalid(format!(
            "Phase '{}' has invalid mode '{}'. Supported modes: '{}', '{}'",
            phase_name, other, PHASE_MODE_TRANSITIONS, PHASE_MODE_ENTITY
        ))),
    }
}

fn validate_workflow(phases: &[PhaseConfig]) -> Result<(), WorkflowError> {
    let phase_names: std::collections::HashSet<&str> =
        phases.iter().map(|p| p.name.as_str()).collect();

    for phase in phases {
        let states: std::collections::HashSet<&str> =
            phase.states.iter().map(|s| s.as_str()).collect();
        for transition in &phase.transitions {
            if !states.contains(transition.source.as_str()) {
                return Err(WorkflowError::invalid(format!(
                    "Phase '{}' transition source '{}' is not a phase state",
                    phase.name, transition.source
                )));
            }
            if !states.contains(transition.destination.as_str()) {
                return Err(WorkflowError::invalid(format!(
                    "Phase '{}' transition destination '{}' is not a phase state",
                    phase.name, transition.destination
                )));
            }
            if let Some(jump) = &transition.jump {
                if !phase_names.contains(jump.as_str()) {
                    return Err(WorkflowError::invalid(format!(
                        "Phase '{}' transition jump target '{}' is undefined",
                        phase.name, jump
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_workflow_parses() {
        let yaml = r#"
phases:
  tasks:
    states: [new, done]
    transitions:
      - from: new
        to: done
"#;
        let dir = tempfile::tempdir().unwrap();
        let config = load_workflow(yaml, dir.path()).unwrap();
        assert_eq!(config.phases.len(), 1);
        assert_eq!(config.phases[0].name, "tasks");
        assert_eq!(config.retries, 3);
    }

    #[test]
    fn test_reserved_failed_state_rejected() {
        let yaml = r#"
phases:
  tasks:
    states: [new, _failed]
"#;
        let dir = tempfile::tempdir().unwrap();
        assert!(load_workflow(yaml, dir.path()).is_err());
    }

    #[test]
    fn test_stdin_requires_cmd() {
        let yaml = r#"
phases:
  tasks:
    states: [new, done]
    transitions:
      - from: new
        to: done
        stdin: "hello"
"#;
        let dir = tempfile::tempdir().unwrap();
        assert!(load_workflow(yaml, dir.path()).is_err());
    }

    #[test]
    fn test_transition_source_must_be_a_state() {
        let yaml = r#"
phases:
  tasks:
    states: [new, done]
    transitions:
      - from: nonexistent
        to: done
"#;
        let dir = tempfile::tempdir().unwrap();
        assert!(load_workflow(yaml, dir.path()).is_err());
    }

    #[test]
    fn test_jump_target_must_be_a_phase() {
        let yaml = r#"
phases:
  tasks:
    states: [new, done]
    transitions:
      - from: new
        to: done
        jump: nonexistent
"#;
        let dir = tempfile::tempdir().unwrap();
        assert!(load_workflow(yaml, dir.path()).is_err());
    }

    #[test]
    fn test_entity_mode_parses() {
        let yaml = r#"
phases:
  tasks:
    mode: entity
    states: [new, done]
"#;
        let dir = tempfile::tempdir().unwrap();
        let config = load_workflow(yaml, dir.path()).unwrap();
        assert_eq!(config.phases[0].mode, PhaseMode::PerEntity);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let yaml = r#"
phases:
  tasks:
    mode: bogus
    states: [new, done]
"#;
        let dir = tempfile::tempdir().unwrap();
        assert!(load_workflow(yaml, dir.path()).is_err());
    }

    #[test]
    fn test_env_progressive_rendering() {
        let yaml = r#"
env:
  GREETING: "hello"
  FULL: "{{ GREETING }} world"
phases:
  tasks:
    states: [new, done]
"#;
        let dir = tempfile::tempdir().unwrap();
        let config = load_workflow(yaml, dir.path()).unwrap();
        assert_eq!(config.environment.get("GREETING").unwrap(), "hello");
        assert_eq!(config.environment.get("FULL").unwrap(), "hello world");
    }

    #[test]
    fn test_env_cycle_is_invalid_workflow() {
        let yaml = r#"
env:
  A: "{{ B }}"
  B: "{{ A }}"
phases:
  tasks:
    states: [new, done]
"#;
        let dir = tempfile::tempdir().unwrap();
        assert!(load_workflow(yaml, dir.path()).is_err());
    }

    #[test]
    fn test_directory_bindings_reachable_from_env() {
        let yaml = r#"
env:
  NEW_DIR: "{{ DIR_TASKS_NEW }}"
phases:
  tasks:
    states: [new, done]
"#;
        let dir = tempfile::tempdir().unwrap();
        let config = load_workflow(yaml, dir.path()).unwrap();
        let expected = dir.path().join("tasks").join("new").display().to_string();
        assert_eq!(config.environment.get("NEW_DIR").unwrap(), &expected);
    }
}
