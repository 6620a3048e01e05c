//! Where is an instance running, and is it up?

use async_trait::async_trait;
use pinwheel_core::RequestContext;
use pinwheel_state::{PowerState, StateStore};

use crate::error::ConductorResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLocation {
    pub host: String,
    pub status: PowerState,
}

/// Resolves an instance to its current host.
///
/// Used when a mapping is created for an instance that is already placed.
#[async_trait]
pub trait InstanceLocator: Send + Sync {
    async fn locate(
        &self,
        ctx: &RequestContext,
        instance_uuid: &str,
    ) -> ConductorResult<Option<InstanceLocation>>;
}

/// Answers from the instance inventory that host trackers report.
#[derive(Clone)]
pub struct InventoryLocator {
    store: StateStore,
}

impl InventoryLocator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InstanceLocator for InventoryLocator {
    async fn locate(
        &self,
        _ctx: &RequestContext,
        instance_uuid: &str,
    ) -> ConductorResult<Option<InstanceLocation>> {
        Ok(self.store.get_instance(instance_uuid)?.and_then(|instance| {
            instance.host.map(|host| InstanceLocation {
                host,
                status: instance.status,
            })
        }))
    }
}
