use std::collections::BTreeMap;
use std::path::Path;

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

/// Render context: `env_vars` flattened at the top level, and reachable again
/// under an explicit `env` key for templates that prefer `env.FOO`.
#[derive(Serialize)]
struct RenderContext<'a> {
    #[serde(flatten)]
    vars: &'a BTreeMap<String, String>,
    env: &'a BTreeMap<String, String>,
}

/// Sandboxed string-template renderer shared by env rendering (`config`) and
/// per-invocation stdin rendering (`hooks`). Strict-undefined: referencing a
/// variable not present in `env_vars` is a render error, never an empty
/// string.
pub struct TemplateRenderer {
    root: std::path::PathBuf,
}

impl TemplateRenderer {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        TemplateRenderer { root: root.into() }
    }

    /// Render `template` with `env_vars` flattened into the top-level context
    /// and also reachable under an explicit `env` key, plus `read_file` /
    /// `include_file` helpers that resolve relative paths against `root`.
    pub fn render(
        &self,
        template: &str,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<String, TemplateRenderError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        let root = self.root.clone();
        env.add_function("read_file", move |path: String| -> Result<String, minijinja::Error> {
            read_relative(&root, &path).map_err(|e| {
                minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e)
            })
        });
        let root = self.root.clone();
        env.add_function("include_file", move |path: String| -> Result<String, minijinja::Error> {
            read_relative(&root, &path).map_err(|e| {
                minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e)
            })
        });

        let ctx = RenderContext {
            vars: env_vars,
            env: env_vars,
        };

        let compiled = env
            .template_from_str(template)
            .map_err(|e| TemplateRenderError(e.to_string()))?;
        compiled
            .render(ctx)
            .map_err(|e| TemplateRenderError(e.to_string()))
    }
}

fn read_relative(root: &Path, raw_path: &str) -> Result<String, String> {
    if raw_path.is_empty() {
        return Err("read_file/include_file path must be a non-empty string".to_string());
    }
    let path = Path::new(raw_path);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    std::fs::read_to_string(&resolved)
        .map_err(|e| format!("unable to read file '{}': {}", resolved.display(), e))
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TemplateRenderError(pub String);
