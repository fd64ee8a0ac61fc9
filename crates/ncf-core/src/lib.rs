//! # ncf core
//!
//! The backup orchestration engine and its immediate collaborators: the
//! platform model, the configuration scrubber, the credential resolver, the
//! two bounded worker pools (terminal and HTTP), the per-job progress bus,
//! and the orchestrator that drives a job from start to terminal state.
//!
//! Persistence and the repository service are reached through narrow seams:
//! the [`store::JobStore`] trait (implemented by `ncf-db`) and
//! [`ncf_git::RepoClient`].

pub mod api;
pub mod cancel;
pub mod cli;
pub mod device;
pub mod engine;
pub mod error;
pub mod platform;
pub mod progress;
pub mod resolver;
pub mod scrubber;
pub mod store;

pub use cancel::CancelToken;
pub use device::{Credentials, DeviceFacts, DeviceOutcome, FetchOutcome};
pub use engine::{BackupEngine, EngineConfig};
pub use error::{DeviceError, EngineError};
pub use platform::{Platform, Transport};
pub use progress::{JobState, ProgressBus, ProgressEvent};
pub use scrubber::{scrub, ScrubOutcome};
