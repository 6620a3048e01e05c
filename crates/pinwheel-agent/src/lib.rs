//! pinwheel-agent — everything that runs on a compute host.
//!
//! - [`PinExecutor`]: compiles a mapping against the host and pins every vCPU
//! - [`HostResourceTracker`]: periodic topology and instance report to the conductor
//! - [`EventDispatcher`]: turns instance lifecycle notifications into applies
//! - [`build_router`]: the agent's RPC endpoint and notification intake

pub mod conductor_client;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod server;
pub mod tracker;

pub use conductor_client::{ConductorApi, HttpConductorClient};
pub use dispatcher::{Dispatch, EventDispatcher, IgnoreReason, Notification};
pub use error::{DispatchError, ExecutorError, TrackerError};
pub use executor::{PinExecutor, PinOutcome};
pub use server::{AgentState, build_router};
pub use tracker::{HostResourceTracker, TrackerReport};
