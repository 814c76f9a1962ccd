pub mod launcher;
pub mod port;
pub mod profile;

pub use launcher::build_command;
pub use port::PortAllocator;
pub use profile::{kill_stale_processes, seed_profile, SeedReport};
