//! Capture producers: one per artifact kind, composed behind a single trait.

mod command;
mod composite;
mod locate;
mod sysinfo;
mod traits;

pub use command::*;
pub use composite::*;
pub use locate::*;
pub use sysinfo::*;
pub use traits::*;
