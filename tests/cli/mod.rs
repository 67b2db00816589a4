//! CLI module tests.

mod events_test;
mod stream_test;
