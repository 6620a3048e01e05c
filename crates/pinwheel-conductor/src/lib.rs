//! pinwheel-conductor — the system of record for CPU mappings.
//!
//! [`MappingService`] owns every mapping status transition. It accepts
//! topology and instance reports from host trackers, creates mappings on
//! request, and drives each apply cycle by calling the owning host's pin
//! executor through an [`ExecutorClient`]. [`build_router`] exposes it over
//! the pinwheel RPC protocol plus a small read-only inspection API.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/rpc/v1/create_instance_cpu_mapping` | Create a mapping |
//! | POST | `/rpc/v1/reconcile_instance` | Re-apply after a lifecycle event |
//! | POST | `/rpc/v1/reconcile_host` | Host topology report |
//! | POST | `/rpc/v1/reconcile_instances` | Instance state report |
//! | POST | `/rpc/v1/reapply_instance_cpu_mapping` | Start a new apply cycle |
//! | GET | `/v1/instance_cpu_mappings` | List mappings |
//! | GET | `/v1/instance_cpu_mappings/{uuid}` | Get one mapping |
//! | DELETE | `/v1/instance_cpu_mappings/{uuid}` | Delete a mapping |
//! | GET | `/v1/hosts` | List hosts |
//! | GET | `/v1/instances` | List instances |

pub mod error;
pub mod executor_client;
pub mod locator;
pub mod server;
pub mod service;

pub use error::{ConductorError, ConductorResult};
pub use executor_client::{ExecutorClient, HttpExecutorClient};
pub use locator::{InstanceLocation, InstanceLocator, InventoryLocator};
pub use server::{ConductorState, build_router};
pub use service::MappingService;
