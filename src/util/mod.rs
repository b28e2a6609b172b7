//! Module implement common utility functions and types.

pub mod files;
pub mod spinlock;
pub mod thread;

pub use files::load_toml;
pub use spinlock::Spinlock;
pub use thread::Thread;
