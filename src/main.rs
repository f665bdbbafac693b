use std::path::{Path, PathBuf};

use clap::Parser;

use dirorch::config::load_workflow;
use dirorch::engine::WorkflowEngine;
use dirorch::log::{parse_log_level, set_log_level};
use dirorch::log_error;

#[derive(Parser)]
#[command(name = "dirorch", about = "Run directory-based workflow orchestration")]
struct Cli {
    /// Workflow path, or name resolved from $XDG_CONFIG_DIR/dirorch/workflows/<name>.yml
    /// (fallback: ~/.config/dirorch/workflows/<name>.yml)
    workflow: PathBuf,

    /// Root directory for workflow state directories (default: current directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Retries for hooks (overrides YAML retries; retries count excludes first attempt)
    #[arg(long)]
    retries: Option<u32>,

    /// Runtime state file name under --root
    #[arg(long, default_value = ".dirorch_runtime.json")]
    state_file: String,

    /// Logging verbosity (DEBUG, INFO, WARNING, ERROR)
    #[arg(long, default_value = "INFO")]
    log_level: String,
}

/// Resolves the `workflow` CLI argument to a concrete YAML path. A bare name
/// with no directory component and no extension is looked up under the
/// dirorch config directory; anything else is treated as an explicit path.
fn resolve_workflow_path(workflow: &Path) -> PathBuf {
    if is_explicit_path(workflow) {
        return expand_home(workflow);
    }
    config_dir()
        .join("dirorch")
        .join("workflows")
        .join(format!(
            "{}.yml",
            workflow.file_name().and_then(|n| n.to_str()).unwrap_or("")
        ))
}

fn is_explicit_path(workflow: &Path) -> bool {
    workflow.is_absolute()
        || workflow.parent().map(|p| p != Path::new("")).unwrap_or(false)
        || workflow.extension().is_some()
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_DIR") {
        return expand_home(Path::new(&xdg));
    }
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".config"))
        .unwrap_or_else(|| PathBuf::from(".config"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match parse_log_level(&cli.log_level) {
        Ok(level) => level,
        Err(msg) => {
            log_error!("Error: {}", msg);
            std::process::exit(1);
        }
    };
    set_log_level(log_level);

    let root = cli.root.unwrap_or_else(|| PathBuf::from("."));
    let workflow_path = resolve_workflow_path(&cli.workflow);

    let yaml_text = match std::fs::read_to_string(&workflow_path) {
        Ok(text) => text,
        Err(e) => {
            log_error!(
                "Error: failed to read workflow file {}: {}",
                workflow_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    let mut config = match load_workflow(&yaml_text, &root) {
        Ok(config) => config,
        Err(e) => {
            log_error!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(retries) = cli.retries {
        config.retries = retries;
    }

    let engine = WorkflowEngine::new(config, root, &cli.state_file);
    if let Err(e) = engine.run().await {
        log_error!("Error: {}", e);
        std::process::exit(1);
    }
}
