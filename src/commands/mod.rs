//! One-shot mirrord commands that run to completion.

mod capture;
mod ls;
mod verify_config;

pub use capture::*;
pub use ls::*;
pub use verify_config::*;
