//! EventDispatcher — instance lifecycle notifications to pin applies.
//!
//! Only `instance.create.end` and `instance.instance_metadata_update` are
//! handled, only for instances on this host, and only when the instance
//! metadata carries the trigger key. In `conductor` mode the event becomes
//! a `reconcile_instance` call so the outcome is recorded; in `direct` mode
//! the local executor applies the trigger value and nothing is recorded.

use std::collections::HashMap;
use std::sync::Arc;

use pinwheel_core::config::DispatchMode;
use pinwheel_core::{CpuSpecError, RequestContext, validate};
use pinwheel_state::MappingRecord;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::conductor_client::ConductorApi;
use crate::error::DispatchError;
use crate::executor::{PinExecutor, PinOutcome};

pub const INSTANCE_CREATED: &str = "instance.create.end";
pub const INSTANCE_METADATA_UPDATED: &str = "instance.instance_metadata_update";

/// An instance lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: String,
    #[serde(default)]
    pub publisher_id: Option<String>,
    pub instance_uuid: String,
    /// Host the instance is on.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    UnsupportedEvent(String),
    OtherHost(Option<String>),
    NoTrigger,
    InvalidTrigger(CpuSpecError),
}

/// What the dispatcher did with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Ignored(IgnoreReason),
    /// Routed through the conductor; `None` if it holds no mapping.
    Reconciled(Option<MappingRecord>),
    /// Applied directly on this host.
    Applied(PinOutcome),
}

pub struct EventDispatcher {
    host_name: String,
    trigger_key: String,
    mode: DispatchMode,
    conductor: Arc<dyn ConductorApi>,
    executor: Arc<PinExecutor>,
}

impl EventDispatcher {
    pub fn new(
        host_name: impl Into<String>,
        trigger_key: impl Into<String>,
        conductor: Arc<dyn ConductorApi>,
        executor: Arc<PinExecutor>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            trigger_key: trigger_key.into(),
            mode: DispatchMode::Conductor,
            conductor,
            executor,
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// The trigger value of a notification this host should act on.
    fn triage<'a>(&self, notification: &'a Notification) -> Result<&'a str, IgnoreReason> {
        let event = notification.event_type.to_ascii_lowercase();
        if event != INSTANCE_CREATED && event != INSTANCE_METADATA_UPDATED {
            return Err(IgnoreReason::UnsupportedEvent(notification.event_type.clone()));
        }
        if notification.host.as_deref() != Some(self.host_name.as_str()) {
            return Err(IgnoreReason::OtherHost(notification.host.clone()));
        }
        let spec = notification
            .metadata
            .get(&self.trigger_key)
            .ok_or(IgnoreReason::NoTrigger)?;
        validate(spec).map_err(IgnoreReason::InvalidTrigger)?;
        Ok(spec)
    }

    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        notification: &Notification,
    ) -> Result<Dispatch, DispatchError> {
        let spec = match self.triage(notification) {
            Ok(spec) => spec,
            Err(reason) => {
                if let IgnoreReason::InvalidTrigger(e) = &reason {
                    warn!(instance_uuid = %notification.instance_uuid, error = %e, "ignoring malformed trigger value");
                } else {
                    debug!(instance_uuid = %notification.instance_uuid, ?reason, "notification ignored");
                }
                return Ok(Dispatch::Ignored(reason));
            }
        };

        let uuid = notification.instance_uuid.as_str();
        info!(
            instance_uuid = %uuid,
            event = %notification.event_type,
            %spec,
            mode = ?self.mode,
            "pin trigger received"
        );

        match self.mode {
            DispatchMode::Conductor => {
                let mapping = self
                    .conductor
                    .reconcile_instance(ctx, uuid, &self.host_name)
                    .await?;
                if mapping.is_none() {
                    debug!(instance_uuid = %uuid, "conductor holds no mapping for instance");
                }
                Ok(Dispatch::Reconciled(mapping))
            }
            DispatchMode::Direct => Ok(Dispatch::Applied(self.executor.apply(uuid, spec).await?)),
        }
    }

    /// Consume notifications until the channel closes or shutdown fires.
    /// Each notification is handled on its own task.
    pub async fn run(
        self: Arc<Self>,
        mut notifications: mpsc::Receiver<Notification>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(host = %self.host_name, trigger_key = %self.trigger_key, mode = ?self.mode, "event dispatcher started");
        loop {
            tokio::select! {
                received = notifications.recv() => {
                    let Some(notification) = received else {
                        break;
                    };
                    let this = self.clone();
                    tokio::spawn(async move {
                        let ctx = RequestContext::service("dispatch");
                        if let Err(e) = this.dispatch(&ctx, &notification).await {
                            warn!(instance_uuid = %notification.instance_uuid, error = %e, "notification dispatch failed");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        info!("event dispatcher shutting down");
    }
}
