//! HTTP and WebSocket edge for taskmesh.
//!
//! Everything here translates between wire formats and the engine's
//! documented operations; orchestration semantics live in
//! `taskmesh-engine`. The crate also ships the `taskmesh-server`
//! binary, which performs all construction in `main` and injects
//! dependencies explicitly.

pub mod api;
pub mod error;
pub mod server;
pub mod state;
pub mod ws;

pub use error::{ApiError, ApiResult, ErrorEnvelope};
pub use server::{build_router, serve};
pub use state::{AppState, InFlightSampler};
