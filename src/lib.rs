// Library root: exposes every module so integration tests and other
// binaries can drive the full client stack.

pub mod api;
pub mod config;
pub mod engine;
pub mod events;
pub mod sse;
pub mod store;
