//! Debug Adapter Protocol plumbing for the Python runtime family.
//!
//! Three layers, innermost first:
//! - [`codec`]: the `Content-Length`-framed JSON message format.
//! - [`client`]: an async client that correlates requests to responses by
//!   sequence number and fans events out to subscribers.
//! - [`adapter`]: launches a program under `debugpy` and maps the uniform
//!   [`fathom_core::DebugAdapter`] operations onto DAP requests.

pub mod adapter;
pub mod client;
pub mod codec;

pub use adapter::PythonAdapter;
pub use client::{DapClient, DapError, DapEvent};
