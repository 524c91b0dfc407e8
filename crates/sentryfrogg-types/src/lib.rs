pub mod audit;
pub mod error;
pub mod path;
pub mod profile;
pub mod runbook;
pub mod shape;

pub use audit::{AuditEntry, AuditStatus, CacheEnvelope, CacheKind};
pub use error::{ErrorCategory, ToolError};
pub use profile::{Profile, ProfileKind, ProfileSummary, Project, SealedValue, StoredProfile, TargetBinding};
pub use runbook::{Predicate, RunReport, Runbook, Step, StepReport, StepRetry, StepStatus};
pub use shape::{MissingPolicy, OutputShape, StateScope, StoreAs};

/// Convenience alias used across manager and tool signatures.
pub type ToolResult<T> = Result<T, ToolError>;
