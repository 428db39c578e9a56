//! Configuration for the sandbox, reflection loop and handoff protocol.
//!
//! Every field has a serde default so a partial TOML file (or none at all)
//! yields a usable configuration. [`Validate`] catches bad values early.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Paths that are never promoted, regardless of configuration.
pub const DEFAULT_PROTECTED_PATHS: &[&str] = &[
    ".env",
    ".git/",
    "secrets",
    "id_rsa",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "src/handoff/",
];

/// Workspace paths not copied into the sandbox.
pub const DEFAULT_EXCLUDE_PATHS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    "coverage",
    ".next",
    ".turbo",
    ".cache",
    ".crucible",
];

/// Container sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container engine CLI.
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Container image.
    #[serde(default = "default_image")]
    pub image: String,
    /// Memory cap, in the engine's notation (e.g. "2g").
    #[serde(default = "default_memory")]
    pub memory: String,
    /// CPU cap.
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Maximum number of processes.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    /// Whether the container gets network access.
    #[serde(default = "default_true")]
    pub network_enabled: bool,
    /// Host workspace to clone into the sandbox.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Mount point of the workspace volume inside the container.
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
    /// Default timeout for a single in-container command.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Prefix for the sandbox's branch name.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Container (and volume) name.
    #[serde(default = "default_container_name")]
    pub container_name: String,
    /// Top-level workspace entries not copied into the sandbox.
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: Vec<String>,
    /// Shell commands run once after the container is created.
    #[serde(default = "default_setup_commands")]
    pub setup_commands: Vec<String>,
    /// Shell command running the project's tests.
    #[serde(default = "default_test_command")]
    pub test_command: String,
    /// Shell command running the project's static checks.
    #[serde(default = "default_type_check_command")]
    pub type_check_command: String,
    /// Launch the embedded dev server after start.
    #[serde(default)]
    pub auto_start_server: bool,
    /// Port of the embedded dev server.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Shell command launching the dev server.
    #[serde(default = "default_server_command")]
    pub server_command: String,
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "node:20-bookworm".to_string()
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> f64 {
    2.0
}

fn default_pids_limit() -> u32 {
    512
}

fn default_true() -> bool {
    true
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_mount_point() -> String {
    "/workspace".to_string()
}

fn default_operation_timeout() -> u64 {
    300 // 5 minutes
}

fn default_branch_prefix() -> String {
    "sandbox".to_string()
}

fn default_container_name() -> String {
    "crucible-sandbox".to_string()
}

fn default_exclude_paths() -> Vec<String> {
    DEFAULT_EXCLUDE_PATHS.iter().map(|s| s.to_string()).collect()
}

fn default_setup_commands() -> Vec<String> {
    vec![
        "command -v git >/dev/null 2>&1 || (apt-get update && apt-get install -y --no-install-recommends git)"
            .to_string(),
    ]
}

fn default_test_command() -> String {
    "npm test --silent".to_string()
}

fn default_type_check_command() -> String {
    "npx tsc --noEmit".to_string()
}

fn default_server_port() -> u16 {
    3000
}

fn default_server_command() -> String {
    "npm run dev".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            image: default_image(),
            memory: default_memory(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            network_enabled: true,
            workspace_root: default_workspace_root(),
            mount_point: default_mount_point(),
            operation_timeout_secs: default_operation_timeout(),
            branch_prefix: default_branch_prefix(),
            container_name: default_container_name(),
            exclude_paths: default_exclude_paths(),
            setup_commands: default_setup_commands(),
            test_command: default_test_command(),
            type_check_command: default_type_check_command(),
            auto_start_server: false,
            server_port: default_server_port(),
            server_command: default_server_command(),
        }
    }
}

impl SandboxConfig {
    /// Returns the per-command timeout as a Duration.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Name of the persistent workspace volume.
    pub fn volume_name(&self) -> String {
        format!("{}-workspace", self.container_name)
    }
}

/// Reflection loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    /// Iterations per task unless the task says otherwise.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    /// Required pass rate unless the task says otherwise.
    #[serde(default = "default_required_pass_rate")]
    pub default_required_pass_rate: f64,
    /// Bound on applying and validating one iteration.
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout_secs: u64,
    /// Refinements below this confidence stop the loop.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Finished results kept in memory.
    #[serde(default = "default_max_retained_results")]
    pub max_retained_results: usize,
}

fn default_max_iterations() -> u32 {
    5
}

fn default_required_pass_rate() -> f64 {
    1.0
}

fn default_iteration_timeout() -> u64 {
    180 // 3 minutes
}

fn default_min_confidence() -> f64 {
    0.3
}

fn default_max_retained_results() -> usize {
    100
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            default_required_pass_rate: default_required_pass_rate(),
            iteration_timeout_secs: default_iteration_timeout(),
            min_confidence: default_min_confidence(),
            max_retained_results: default_max_retained_results(),
        }
    }
}

impl ReflectionConfig {
    /// Returns the per-iteration timeout as a Duration.
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

/// Handoff protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Artifacts must be approved before execution.
    #[serde(default = "default_true")]
    pub require_approval: bool,
    /// Commit applied changes in the production workspace.
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    /// Run production tests after applying an artifact.
    #[serde(default = "default_true")]
    pub run_production_tests: bool,
    /// Restore backups when production tests fail.
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
    /// Lifetime of an artifact.
    #[serde(default = "default_artifact_ttl")]
    pub artifact_ttl_secs: u64,
    /// Maximum artifacts kept on disk.
    #[serde(default = "default_max_artifacts")]
    pub max_artifacts: usize,
    /// Extra protected path substrings, added to [`DEFAULT_PROTECTED_PATHS`].
    #[serde(default)]
    pub protected_paths: Vec<String>,
    /// Shell command running the production workspace's tests.
    #[serde(default = "default_test_command")]
    pub production_test_command: String,
    /// Where backups are written. Defaults to `<state_dir>/backups`.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

fn default_artifact_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_max_artifacts() -> usize {
    50
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            require_approval: true,
            auto_commit: true,
            run_production_tests: true,
            auto_rollback: true,
            artifact_ttl_secs: default_artifact_ttl(),
            max_artifacts: default_max_artifacts(),
            protected_paths: Vec::new(),
            production_test_command: default_test_command(),
            backup_dir: None,
        }
    }
}

impl HandoffConfig {
    /// Returns the artifact lifetime as a Duration.
    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    /// Built-in protected paths followed by configured extras.
    pub fn effective_protected_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = DEFAULT_PROTECTED_PATHS.iter().map(|s| s.to_string()).collect();
        for extra in &self.protected_paths {
            if !extra.is_empty() && !paths.contains(extra) {
                paths.push(extra.clone());
            }
        }
        paths
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrucibleConfig {
    /// Directory for persisted state, artifacts and trails.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".crucible")
}

impl Default for CrucibleConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            sandbox: SandboxConfig::default(),
            reflection: ReflectionConfig::default(),
            handoff: HandoffConfig::default(),
        }
    }
}

impl CrucibleConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Loads configuration from a TOML file, or defaults if it doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = ?path, "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Path of the persisted sandbox state.
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("sandbox-state.json")
    }

    /// Directory holding one JSON document per artifact.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }

    /// Directory holding production backups.
    pub fn backup_dir(&self) -> PathBuf {
        self.handoff
            .backup_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("backups"))
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.image.trim().is_empty() {
            result.add_error("sandbox image cannot be empty");
        }
        if !self.mount_point.starts_with('/') {
            result.add_error(format!(
                "mount_point '{}' must be an absolute container path",
                self.mount_point
            ));
        }
        if self.cpus <= 0.0 {
            result.add_error("cpus must be positive");
        }
        if self.pids_limit == 0 {
            result.add_error("pids_limit must be at least 1");
        }
        if self.operation_timeout_secs == 0 {
            result.add_error("operation_timeout_secs must be at least 1");
        }
        if self.branch_prefix.contains(char::is_whitespace) {
            result.add_error("branch_prefix cannot contain whitespace");
        }
        if self.container_name.trim().is_empty() {
            result.add_error("container_name cannot be empty");
        }
        if self.test_command.trim().is_empty() {
            result.add_warning("test_command is empty - every run will count as zero tests");
        }
        if !self.exclude_paths.iter().any(|p| p == ".git") {
            result.add_warning("exclude_paths does not contain .git - it is copied separately anyway");
        }
        if self.network_enabled {
            result.add_warning("network_enabled allows sandboxed code to reach the network");
        }
        if self.operation_timeout_secs > 3600 {
            result.add_warning("operation_timeout_secs over 1 hour may indicate a misconfiguration");
        }

        result
    }
}

impl Validate for ReflectionConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.default_max_iterations == 0 {
            result.add_error("default_max_iterations must be at least 1");
        }
        if self.default_max_iterations > 20 {
            result.add_warning("default_max_iterations > 20 may lead to excessive refine calls");
        }
        if !(0.0..=1.0).contains(&self.default_required_pass_rate) {
            result.add_error("default_required_pass_rate must be between 0 and 1");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            result.add_error("min_confidence must be between 0 and 1");
        }
        if self.iteration_timeout_secs == 0 {
            result.add_error("iteration_timeout_secs must be at least 1");
        }
        if self.max_retained_results == 0 {
            result.add_warning("max_retained_results = 0 means results are not queryable after a run");
        }

        result
    }
}

impl Validate for HandoffConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_artifacts == 0 {
            result.add_error("max_artifacts must be at least 1");
        }
        if self.artifact_ttl_secs == 0 {
            result.add_error("artifact_ttl_secs must be at least 1");
        }
        if !self.require_approval {
            result.add_warning("require_approval = false lets pending artifacts reach production");
        }
        if self.run_production_tests && !self.auto_rollback {
            result.add_warning(
                "auto_rollback = false leaves failed changes in production until rolled back",
            );
        }
        if self.run_production_tests && self.production_test_command.trim().is_empty() {
            result.add_error("production_test_command cannot be empty when tests are enabled");
        }
        for path in &self.protected_paths {
            if path.trim().is_empty() {
                result.add_warning("empty protected path entry is ignored");
            }
        }

        result
    }
}

impl Validate for CrucibleConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.sandbox.validate());
        result.merge(self.reflection.validate());
        result.merge(self.handoff.validate());
        result
    }
}
