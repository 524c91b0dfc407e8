pub mod audit;
pub mod cache;
pub mod crypto;
pub mod fsio;
pub mod paths;
pub mod profiles;
pub mod redact;
pub mod registry;
pub mod state;

use sentryfrogg_types::{ErrorCategory, ProfileKind, Project, Runbook, ToolError};
use serde_json::Value;
use std::path::PathBuf;

pub use audit::AuditLog;
pub use cache::CacheStore;
pub use paths::Paths;
pub use profiles::ProfileStore;
pub use registry::Registry;
pub use state::{StateEntry, StateStore};

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("corrupt store data: {0}")]
    Corrupt(String),

    #[error("{0}")]
    NotFound(String),

    #[error("profile '{name}' is type {actual}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: ProfileKind,
        actual: ProfileKind,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Denied(String),
}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(m) => ToolError::new(ErrorCategory::Internal, "store_io", m),
            StoreError::Crypto(m) => ToolError::new(ErrorCategory::Internal, "crypto", m),
            StoreError::Corrupt(m) => ToolError::new(ErrorCategory::Internal, "profile_corrupt", m),
            StoreError::NotFound(m) => ToolError::new(ErrorCategory::NotFound, "profile_not_found", m),
            StoreError::TypeMismatch { name, expected, actual } => ToolError::new(
                ErrorCategory::InvalidParams,
                "profile_type_mismatch",
                format!("profile '{name}' is type {actual}, expected {expected}"),
            ),
            StoreError::Invalid(m) => ToolError::new(ErrorCategory::InvalidParams, "invalid_params", m),
            StoreError::Denied(m) => ToolError::new(ErrorCategory::Denied, "denied", m),
        }
    }
}

// ── Aggregate store handle ───────────────────────────────────────

/// Everything persistent, opened once at startup and shared process-wide.
#[derive(Clone)]
pub struct Store {
    pub profiles: ProfileStore,
    pub state: StateStore,
    pub projects: Registry<Project>,
    pub runbooks: Registry<Runbook>,
    pub aliases: Registry<String>,
    pub presets: Registry<Value>,
    pub audit: AuditLog,
    pub cache: CacheStore,
    paths: Paths,
}

impl Store {
    /// Open every store under the resolved base directory, creating the
    /// encryption key on first run.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(Paths::resolve())
    }

    pub fn open_at(paths: Paths) -> Result<Self, StoreError> {
        let key = crypto::MasterKey::load_or_create(&paths.key_file())?;
        Ok(Self {
            profiles: ProfileStore::open(paths.profiles_file(), key)?,
            state: StateStore::open(paths.state_file())?,
            projects: Registry::open(paths.projects_file())?,
            runbooks: Registry::open(paths.runbooks_file())?,
            aliases: Registry::open(paths.aliases_file())?,
            presets: Registry::open(paths.presets_file())?,
            audit: AuditLog::new(paths.audit_file()),
            cache: CacheStore::new(paths.cache_dir()),
            paths,
        })
    }

    /// Open against an explicit base directory (tests, overrides).
    pub fn open_in(base: PathBuf) -> Result<Self, StoreError> {
        Self::open_at(Paths::with_base(base))
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }
}
