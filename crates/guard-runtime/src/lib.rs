pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod monitor;
pub mod protection;
pub mod router;
pub mod state;
pub mod worker;

pub use agent::*;
pub use config::Config;
pub use dispatcher::*;
pub use monitor::*;
pub use protection::*;
pub use router::*;
pub use state::*;
pub use worker::*;
