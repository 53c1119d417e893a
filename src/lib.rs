//! Mirrors a blog into a self-contained static directory and optionally
//! commits the result.

pub mod config;
pub mod fetch;
pub mod git;
pub mod pipeline;
pub mod publish;
pub mod rewrite;
pub mod sync;
pub mod telemetry;

pub use config::MirrorConfig;
pub use fetch::{Fetcher, Wget};
pub use pipeline::{Mirror, MirrorError, MirrorOutcome};
pub use publish::{Publisher, RenamePublisher};
