use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::HookConfig;
use crate::template::TemplateRenderer;
use crate::{log_debug, log_warn};

/// Runs shell-command hooks with a merged environment, optional templated
/// stdin, and a fixed retry budget. Never fails its caller directly --
/// `run()` reports success or failure as a boolean and leaves escalation to
/// the caller (see `phase_processor`, `engine`).
pub struct HookRunner {
    root: PathBuf,
    defined_env: BTreeMap<String, String>,
    renderer: TemplateRenderer,
    retries: u32,
}

impl HookRunner {
    /// `defined_env` is the workflow's rendered `env` section merged with its
    /// `DIR_<phase>_<state>` directory bindings -- the same map is used both
    /// as the stdin-template context and, overlaid on the inherited process
    /// environment, as what the spawned shell sees.
    pub fn new(root: PathBuf, defined_env: BTreeMap<String, String>, retries: u32) -> Self {
        let renderer = TemplateRenderer::new(root.clone());
        HookRunner {
            root,
            defined_env,
            renderer,
            retries,
        }
    }

    /// Executes `hook.cmd` via a system shell, `retries + 1` times. `extra_env`
    /// wins over the defined environment on collision and is also merged into
    /// the stdin-template context, so transition hooks can reference
    /// `INPUT_ENTITY` in their stdin template.
    pub async fn run(
        &self,
        hook: &HookConfig,
        extra_env: &BTreeMap<String, String>,
        context_label: &str,
    ) -> bool {
        let attempts = self.retries + 1;

        let mut env = self.defined_env.clone();
        env.extend(extra_env.clone());
        let template_ctx = env.clone();

        for attempt in 1..=attempts {
            log_debug!(
                "[hooks] {} attempt {}/{}: {}",
                context_label,
                attempt,
                attempts,
                hook.cmd
            );

            let stdin_payload = match &hook.stdin {
                None => None,
                Some(template) => match self.renderer.render(template, &template_ctx) {
                    Ok(rendered) => Some(rendered),
                    Err(e) => {
                        log_warn!(
                            "[hooks] {} attempt {}/{}: stdin render failed: {}",
                            context_label,
                            attempt,
                            attempts,
                            e
                        );
                        continue;
                    }
                },
            };

            match self.spawn_and_wait(&hook.cmd, &env, stdin_payload).await {
                Ok(true) => return true,
                Ok(false) => {
                    log_warn!(
                        "[hooks] {} attempt {}/{} failed (non-zero exit)",
                        context_label,
                        attempt,
                        attempts
                    );
                }
                Err(e) => {
                    log_warn!(
                        "[hooks] {} attempt {}/{} failed to spawn: {}",
                        context_label,
                        attempt,
                        attempts,
                        e
                    );
                }
            }
        }

        false
    }

    async fn spawn_and_wait(
        &self,
        cmd: &str,
        env: &BTreeMap<String, String>,
        stdin_payload: Option<String>,
    ) -> std::io::Result<bool> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command.current_dir(&self.root);
        command.envs(env);
        command.stdin(if stdin_payload.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        });
        command.stdout(std::process::Stdio::inherit());
        command.stderr(std::process::Stdio::inherit());

        let mut child = command.spawn()?;

        if let Some(payload) = stdin_payload {
            let mut stdin = child.stdin.take().expect("stdin was configured as piped");
            stdin.write_all(payload.as_bytes()).await?;
            drop(stdin);
        }

        let status = child.wait().await?;
        Ok(status.success())
    }
}
