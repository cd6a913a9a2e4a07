#[macro_use]
extern crate log;

pub mod assembler;
pub mod config;
pub mod delivery;
pub mod download;
pub mod error;
pub mod expander;
pub mod matcher;
pub mod message;
pub mod pipeline;
pub mod platform;
pub mod state;
pub mod utils;

pub use assembler::{ItemFailure, MediaReference, ReplyPayload, ReplySegment, ResolutionResult};
pub use config::PipelineConfig;
pub use download::{DownloadManager, TransferState};
pub use error::{PipelineError, PipelineResult, Stage};
pub use message::MessagePayload;
pub use pipeline::{MessageOutcome, Pipeline};
pub use platform::Platform;
pub use state::StatsSnapshot;
