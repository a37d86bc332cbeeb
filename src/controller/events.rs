//! Kubernetes events published by the reconcilers

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType};
use tracing::warn;

use crate::controller::context::Context;

/// Reason of the warning recorded when a phase fails, e.g. `FailedPhaseCreating`
pub fn failed_phase_reason(phase: &str) -> String {
    format!("FailedPhase{}", phase)
}

async fn publish(ctx: &Context, reference: &ObjectReference, event: Event) {
    if let Err(e) = ctx.recorder.publish(&event, reference).await {
        warn!(reason = %event.reason, error = %e, "Failed to publish event");
    }
}

pub async fn phase_failed(ctx: &Context, reference: &ObjectReference, phase: &str, message: &str) {
    publish(
        ctx,
        reference,
        Event {
            type_: EventType::Warning,
            reason: failed_phase_reason(phase),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        },
    )
    .await;
}

pub async fn ready(ctx: &Context, reference: &ObjectReference, message: &str) {
    publish(
        ctx,
        reference,
        Event {
            type_: EventType::Normal,
            reason: "Ready".to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        },
    )
    .await;
}
