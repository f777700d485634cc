//! Butlers RPC - The per-butler JSON-RPC tool surface.
//!
//! Every butler exposes the same fixed core surface over HTTP:
//! `status`, `trigger`, `route_execute`, `tick`, state and schedule
//! CRUD, session queries, approvals, and `notify`. Module tools are
//! registered alongside under their declared names.
//!
//! `route_execute` is the routed execution entrypoint: it enforces
//! `trusted_route_callers` before any side effect, negotiates the
//! route contract version, and spawns a session carrying the request
//! context. `notify` on a non-Switchboard butler wraps the payload as
//! a `route.v1` bound for Switchboard, which is the only place that
//! terminates it (Messenger terminates at its delivery adapters).
//!
//! Transport disconnects while posting routine responses are logged at
//! debug and never escalate; the tool result is already durable by
//! then.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod api;

mod client;
mod error;
mod server;
mod state;
mod types;

pub use api::{ButlerRpcClient, ButlerRpcServer};
pub use client::ButlerClient;
pub use error::{RpcError, RpcResult};
pub use server::{RpcServerHandle, serve};
pub use state::{IngressPlane, PlaneOverride, RouteVersion, RpcState};
pub use types::{ScheduleCreateParams, StateSetParams, StatusResponse, TriggerParams};
