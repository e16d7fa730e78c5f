//! Real-time segmentation gateway: WebSocket sessions feeding frames through
//! the shared model pool and streaming rendered class maps back.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `protocol`: Wire envelopes and the error taxonomy.
//! - `codec`: Base64/JPEG decode and encode for frame payloads.
//! - `render`: The four visualization modes over image + class map.
//! - `pipeline`: Per-session admission gate (in-flight cap, rate limit).
//! - `session`: Connection lifecycle, dispatch, and the session worker.
//! - `server`: Actix Web endpoints (`/ws`, `/health`, `/metrics`).
//! - `telemetry`: Tracing and Prometheus wiring.

pub use config::{GatewayArgs, GatewayConfig};
pub use server::{run, ServeError};

mod codec;
mod config;
mod pipeline;
mod protocol;
mod render;
mod server;
mod session;
pub(crate) mod telemetry;
