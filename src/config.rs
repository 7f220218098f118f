use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::DispatchError;
use crate::types::Role;

pub const CONFIG_FILE_NAME: &str = "ticket-dispatch.toml";

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub store: StoreConfig,
    pub monitor: MonitorConfig,
    pub orchestrator: OrchestratorConfig,
    pub launcher: LauncherConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
    pub fallback_path: Option<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub debounce_ms: u64,
    pub watch: bool,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent: u32,
    pub cooldown_secs: u64,
    pub dispatch_delay_ms: u64,
    pub restart_settle_ms: u64,
    pub close_sessions: bool,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    pub timeout_secs: u64,
    pub model: Option<String>,
    pub workspace: Option<String>,
    /// Per-role prompt templates keyed by role name.
    pub prompts: HashMap<String, String>,
    /// Launch methods tried in order; the first success wins.
    pub commands: Vec<LaunchCommand>,
}

/// One way of opening an agent session, e.g. the `cursor-agent` CLI.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct LaunchCommand {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Appended to `args` only when a model is configured.
    #[serde(default)]
    pub model_args: Vec<String>,
    #[serde(default)]
    pub requires_prompt: bool,
    /// Treat a process still running at the timeout as a live session.
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub install_hint: Option<String>,
}

impl LaunchCommand {
    pub fn new(name: &str, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            model_args: vec![],
            requires_prompt: false,
            detach: false,
            install_hint: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "tickets.csv".to_string(),
            fallback_path: Some(".cursor/tickets.csv".to_string()),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            debounce_ms: 500,
            watch: true,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            cooldown_secs: 300,
            dispatch_delay_ms: 2000,
            restart_settle_ms: 500,
            close_sessions: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_delay_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            model: None,
            workspace: None,
            prompts: HashMap::new(),
            commands: default_launch_commands(),
        }
    }
}

impl LauncherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Configured prompt template for a role, falling back to the built-in one.
    pub fn prompt_template(&self, role: Role) -> &str {
        self.prompts
            .get(role.as_str())
            .map(String::as_str)
            .unwrap_or_else(|| default_prompt(role))
    }
}

pub fn default_prompt(role: Role) -> &'static str {
    match role {
        Role::Swe => "run swe agent on {ticket_id}",
        Role::Qa => "Use @.cursor/rules/qa-agent.mdc to review {ticket_id}",
        Role::Pm => "Use @.cursor/rules/pm-agent.mdc for {ticket_id}",
        Role::Docs => "run docs agent on {ticket_id}",
    }
}

pub fn default_launch_commands() -> Vec<LaunchCommand> {
    vec![
        LaunchCommand {
            model_args: vec!["-m".to_string(), "{model}".to_string()],
            requires_prompt: true,
            install_hint: Some("Install the Cursor CLI: https://cursor.com/cli".to_string()),
            ..LaunchCommand::new("cursor-agent", "cursor-agent", &["-p", "{prompt}"])
        },
        LaunchCommand {
            install_hint: Some(
                "Enable the `cursor` shell command from the Cursor command palette".to_string(),
            ),
            ..LaunchCommand::new("cursor", "cursor", &["{workspace}"])
        },
    ]
}

pub fn validate(config: &DispatchConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.store.path.trim().is_empty() {
        errors.push("store.path must not be empty".to_string());
    }

    if config.monitor.poll_interval_secs < 1 {
        errors.push("monitor.poll_interval_secs must be >= 1".to_string());
    }

    if config.orchestrator.max_concurrent < 1 {
        errors.push("orchestrator.max_concurrent must be >= 1".to_string());
    }

    if config.orchestrator.cooldown_secs < 1 {
        errors.push("orchestrator.cooldown_secs must be >= 1".to_string());
    }

    if config.launcher.timeout_secs < 1 {
        errors.push("launcher.timeout_secs must be >= 1".to_string());
    }

    for key in config.launcher.prompts.keys() {
        if crate::types::parse_role(key).is_err() {
            errors.push(format!(
                "launcher.prompts: unknown role '{}' (expected swe, qa, pm, or docs)",
                key
            ));
        }
    }

    let mut seen_names = HashSet::new();
    for command in &config.launcher.commands {
        if command.program.trim().is_empty() {
            errors.push(format!(
                "launcher.commands: '{}' has an empty program",
                command.name
            ));
        }
        if !seen_names.insert(&command.name) {
            errors.push(format!(
                "launcher.commands: duplicate command name '{}'",
                command.name
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn load_config(project_root: &Path) -> Result<DispatchConfig, DispatchError> {
    load_config_from(None, project_root)
}

/// Load configuration from an explicit file, or from `ticket-dispatch.toml` in the root.
///
/// An explicit path must exist. The default file may be absent, in which case
/// every setting takes its default value. Every failure is a fatal
/// [`DispatchError::Config`].
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<DispatchConfig, DispatchError> {
    read_config(config_path, project_root).map_err(DispatchError::Config)
}

fn read_config(config_path: Option<&Path>, project_root: &Path) -> Result<DispatchConfig, String> {
    let path: PathBuf = match config_path {
        Some(p) => {
            if !p.exists() {
                return Err(format!("Config file not found: {}", p.display()));
            }
            p.to_path_buf()
        }
        None => project_root.join(CONFIG_FILE_NAME),
    };

    if !path.exists() {
        let mut config = DispatchConfig::default();
        populate_default_commands(&mut config);
        return Ok(config);
    }

    let contents = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut config: DispatchConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    populate_default_commands(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

/// Directory relative store paths resolve against.
///
/// With an explicit `--config` this is the config file's directory; otherwise the project root.
pub fn base_dir(config_path: Option<&Path>, project_root: &Path) -> PathBuf {
    config_path
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| project_root.to_path_buf())
}

fn populate_default_commands(config: &mut DispatchConfig) {
    if config.launcher.commands.is_empty() {
        config.launcher.commands = default_launch_commands();
    }
}
