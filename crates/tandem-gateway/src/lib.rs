//! tandem-gateway — HTTP front end for tandem
//!
//! Exposes chat (SSE and complete), image, video and optimize endpoints over a
//! shared [`tandem_core::RequestHandler`], plus provider listing and status.

pub mod protocol;
pub mod server;

pub use server::{GatewayServer, GatewayState};
