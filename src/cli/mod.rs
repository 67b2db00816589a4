//! CLI module for mirrord process spawning and progress stream parsing.

mod error;
mod events;
mod process;
mod stream;

pub use error::*;
pub use events::*;
pub use process::*;
pub use stream::*;
