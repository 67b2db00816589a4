//! Supervisor module: the run state machine, its channels and the runner.

mod channel;
mod error;
mod preflight;
mod runner;
mod state;
mod warnings;

pub use channel::*;
pub use error::*;
pub use preflight::*;
pub use runner::*;
pub use state::*;
pub use warnings::*;
