//! TOML-based configuration.
//!
//! Secrets are never stored in the file. The `[remote]` section names the
//! environment variable holding the access token (`token_env`), resolved at
//! runtime via [`ModelMergeConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{ConfigError, RepositoryError};
use crate::integrity::{validators, IntegrityChecker};
use crate::merge::{ConflictPolicy, FallbackChoice, Preference};
use crate::store::revision_store::DEFAULT_LOCK_FILE;
use crate::store::{Credentials, MergeStrategy, RevisionStore};

/// Names accepted in `merge.validators`.
pub const KNOWN_VALIDATORS: &[&str] = &["containment_tree"];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMergeConfig {
    /// Repository and document location.
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Identity used for merge commits. Falls back to the repository's
    /// `user.name` / `user.email` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer: Option<CommitterConfig>,

    /// Merge behaviour.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Remote used by `fetch`.
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Working tree root (default: current directory).
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,

    /// Document path relative to the working tree root.
    #[serde(default = "default_document")]
    pub document: PathBuf,

    /// Lock file name inside the git directory.
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}
fn default_document() -> PathBuf {
    PathBuf::from("model.json")
}
fn default_lock_file() -> String {
    DEFAULT_LOCK_FILE.into()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
            document: default_document(),
            lock_file: default_lock_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitterConfig {
    pub name: String,
    pub email: String,
}

/// What to do when the merged document fails validation or git leaves
/// other files conflicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Ask interactively (CLI only; unattended runs cancel).
    #[default]
    Prompt,
    Ours,
    Theirs,
    Cancel,
}

impl OnFailure {
    /// The fixed choice, `None` for [`OnFailure::Prompt`].
    pub fn fixed_choice(self) -> Option<FallbackChoice> {
        match self {
            Self::Prompt => None,
            Self::Ours => Some(FallbackChoice::TakeOurs),
            Self::Theirs => Some(FallbackChoice::TakeTheirs),
            Self::Cancel => Some(FallbackChoice::Cancel),
        }
    }
}

impl std::str::FromStr for OnFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prompt" => Ok(Self::Prompt),
            "ours" => Ok(Self::Ours),
            "theirs" => Ok(Self::Theirs),
            "cancel" => Ok(Self::Cancel),
            other => Err(format!(
                "expected one of prompt, ours, theirs, cancel; got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Winner of attribute conflicts.
    #[serde(default = "default_attribute_conflicts")]
    pub attribute_conflicts: Preference,

    /// Winner of containment conflicts.
    #[serde(default = "default_containment_conflicts")]
    pub containment_conflicts: Preference,

    /// How git resolves conflicting hunks of non-document files.
    #[serde(default)]
    pub file_favor: MergeStrategy,

    #[serde(default)]
    pub on_integrity_failure: OnFailure,

    /// Stock validators to register (see [`KNOWN_VALIDATORS`]).
    #[serde(default)]
    pub validators: Vec<String>,

    /// Node kinds that must occur exactly once.
    #[serde(default)]
    pub required_singletons: Vec<String>,
}

fn default_attribute_conflicts() -> Preference {
    ConflictPolicy::default().attribute
}
fn default_containment_conflicts() -> Preference {
    ConflictPolicy::default().containment
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            attribute_conflicts: default_attribute_conflicts(),
            containment_conflicts: default_containment_conflicts(),
            file_favor: MergeStrategy::default(),
            on_integrity_failure: OnFailure::default(),
            validators: Vec::new(),
            required_singletons: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_name")]
    pub name: String,

    /// Username for authenticated transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Environment variable holding the access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// Resolved token (populated at runtime, never serialized).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_remote_name() -> String {
    "origin".into()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            name: default_remote_name(),
            username: None,
            token_env: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl ModelMergeConfig {
    /// Load from a TOML file. Environment variables are **not** resolved.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: ModelMergeConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` references. A missing variable only warns; commands
    /// that need the secret fail later through [`credentials`](Self::credentials).
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.remote.token_env {
            self.remote.token = resolve_optional_env(env_name, "remote.token_env");
        }
        Ok(())
    }

    /// Reject empty or contradictory values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.document.as_os_str().is_empty() {
            return Err(invalid("repository.document", "document path must not be empty"));
        }
        if self.repository.document.is_absolute() {
            return Err(invalid(
                "repository.document",
                "document path must be relative to the working tree",
            ));
        }
        let lock = &self.repository.lock_file;
        if lock.is_empty() || lock.contains('/') || lock.contains('\\') {
            return Err(invalid(
                "repository.lock_file",
                "lock file must be a plain, non-empty file name",
            ));
        }
        if let Some(committer) = &self.committer {
            if committer.name.trim().is_empty() || committer.email.trim().is_empty() {
                return Err(invalid(
                    "committer",
                    "committer name and email must both be set",
                ));
            }
        }
        if self.remote.name.is_empty() {
            return Err(invalid("remote.name", "remote name must not be empty"));
        }
        if self.remote.username.is_some() != self.remote.token_env.is_some() {
            return Err(invalid(
                "remote",
                "username and token_env must be configured together",
            ));
        }
        for name in &self.merge.validators {
            if !KNOWN_VALIDATORS.contains(&name.as_str()) {
                return Err(invalid(
                    "merge.validators",
                    &format!("unknown validator '{}'", name),
                ));
            }
        }
        if self.merge.required_singletons.iter().any(|k| k.trim().is_empty()) {
            return Err(invalid(
                "merge.required_singletons",
                "node kinds must not be empty",
            ));
        }
        if !LOG_LEVELS.contains(&self.logging.log_level.to_ascii_lowercase().as_str()) {
            return Err(invalid(
                "logging.log_level",
                &format!("expected one of {}", LOG_LEVELS.join(", ")),
            ));
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, e.g. for a freshly initialised repository.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Derived objects
    // -----------------------------------------------------------------------

    pub fn policy(&self) -> ConflictPolicy {
        ConflictPolicy {
            attribute: self.merge.attribute_conflicts,
            containment: self.merge.containment_conflicts,
        }
    }

    /// Checker with every configured stock validator registered.
    pub fn integrity_checker(&self) -> IntegrityChecker {
        let mut checker = IntegrityChecker::new();
        for name in &self.merge.validators {
            if name == "containment_tree" {
                checker.register("containment_tree", validators::containment_tree);
            }
        }
        for kind in &self.merge.required_singletons {
            checker.register(
                format!("required_singleton:{}", kind),
                validators::required_singleton(kind.clone()),
            );
        }
        checker
    }

    /// Transport credentials, `None` for anonymous access.
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let Some(username) = &self.remote.username else {
            return Ok(None);
        };
        match &self.remote.token {
            Some(secret) => Ok(Some(Credentials {
                username: username.clone(),
                secret: secret.clone(),
            })),
            None => Err(ConfigError::EnvVarMissing {
                var: self.remote.token_env.clone().unwrap_or_default(),
                field: "remote.token_env".into(),
            }),
        }
    }

    /// Open the configured repository. A relative `repository.path` is
    /// resolved against `base`.
    pub fn open_store(&self, base: &Path) -> Result<RevisionStore, RepositoryError> {
        let path = if self.repository.path.is_absolute() {
            self.repository.path.clone()
        } else {
            base.join(&self.repository.path)
        };
        let mut store = RevisionStore::open(&path, &self.repository.document)?
            .with_lock_file(self.repository.lock_file.clone());
        if let Some(c) = &self.committer {
            store = store.with_committer(c.name.clone(), c.email.clone());
        }
        Ok(store)
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Read an environment variable by name; warns and returns `None` when it is
/// unset or empty.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
