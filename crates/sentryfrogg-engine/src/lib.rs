pub mod pipeline;
pub mod predicate;
pub mod runbook;
pub mod template;

pub use pipeline::{ExportSpec, IngestFormat, IngestSpec, PipelineCtx, PipelineEngine, SftpSpec};
pub use runbook::{RunOptions, RunbookEngine, ToolInvoker};
