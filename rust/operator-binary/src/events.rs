//! Kubernetes events emitted by the TLS reconcilers.
//!
//! Publishing is fire-and-forget: a failed event is logged and never fails the
//! reconcile that produced it.

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::api::core::v1::ObjectReference,
    kube::{
        runtime::events::{Event, EventType, Recorder, Reporter},
        Client,
    },
};
use tracing::warn;

pub mod reasons {
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
}

pub const RECONCILE_ACTION: &str = "Reconcile";

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    );
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: RECONCILE_ACTION.to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, %error, "failed to publish event");
        }
    }
}
