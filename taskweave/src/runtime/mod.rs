// Public API
mod arena;
pub use arena::{Arena, ArenaStats, this_arena};

mod builder;
pub use builder::{Builder, Priority};

pub mod global_control;
pub use global_control::GlobalControl;

// Exports
pub(crate) use builder::ArenaConfig;

pub(crate) mod stealing;

mod ticker;
