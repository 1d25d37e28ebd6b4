//! Chrome DevTools Protocol plumbing for the Node runtime family.
//!
//! - [`transport`]: HTTP discovery of the inspector's WebSocket endpoint.
//! - [`client`]: JSON-over-WebSocket client correlating requests by id and
//!   fanning events out by method name.
//! - [`value`]: printable rendering of CDP remote objects.
//! - [`adapter`]: launches a program under `node --inspect-brk` and maps the
//!   uniform [`fathom_core::DebugAdapter`] operations onto CDP commands.

pub mod adapter;
pub mod client;
pub mod transport;
pub mod value;

pub use adapter::NodeAdapter;
pub use client::{CdpClient, CdpError, CdpEvent};
