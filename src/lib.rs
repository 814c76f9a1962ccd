pub mod acquisition;
pub mod autonomy;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod router;
pub mod session;
pub mod state;
pub mod supervisor;

pub use client::{ArenaClient, Selection};
pub use error::{PilotError, Result};
pub use state::SessionContext;
