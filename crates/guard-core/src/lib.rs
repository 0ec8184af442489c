//! Domain model shared by every TeleGuard crate: jobs, artifacts, queue entries,
//! the protection flag, the remote command vocabulary and the error taxonomy.

pub mod backoff;
pub mod commands;
pub mod errors;
pub mod hashing;
pub mod ids;
pub mod model;
pub mod snapshot;
pub mod time;
pub mod types;

pub use backoff::*;
pub use commands::*;
pub use errors::*;
pub use hashing::*;
pub use ids::*;
pub use model::*;
pub use snapshot::*;
pub use time::*;
pub use types::*;
