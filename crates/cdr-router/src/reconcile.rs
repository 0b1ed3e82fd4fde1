//! Reconciliation Engine
//!
//! Folds decoded events into the per-call record. Each event type maps to
//! one atomic UPSERT on the store; convergence under any arrival order comes
//! from the store's COALESCE and status guards, not from in-process locking.
//!
//! The call-ended path is the only read-before-write: it reads the known
//! start/answer times to compute duration and disposition, then writes them
//! in one statement that refuses to touch an already completed record. An
//! answer committed between the read and the write is re-checked by that
//! statement and keeps the call ANSWERED.

use std::sync::Arc;

use cdr_common::{
    clamped_duration_seconds, pii, CompletedCall, Disposition, IdentityUpdate, LifecycleSnapshot,
};
use cdr_store::CallStore;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::schema::{
    CallAnswered, CallEnded, CallStarted, DecodedEvent, RecordingAvailable, UserIdentified,
};
use crate::Result;

/// Switches for the two behaviors the business side has not settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Treat `duration > 0` with normal clearing as answered when no
    /// answer event was seen
    pub infer_answered: bool,
    /// Apply identity updates to calls that already completed
    pub allow_late_identity: bool,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            infer_answered: true,
            allow_late_identity: true,
        }
    }
}

/// Coarse classification of a call-ended termination reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    NormalClearing,
    Busy,
    Failed,
    Other,
}

impl TerminationReason {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return TerminationReason::Other;
        };

        match raw.trim().to_ascii_lowercase().as_str() {
            "normal_clearing" | "normal" | "bye" => TerminationReason::NormalClearing,
            "user_busy" | "busy" => TerminationReason::Busy,
            "call_rejected"
            | "network_out_of_order"
            | "service_unavailable"
            | "temporary_failure"
            | "recovery_on_timer_expire"
            | "destination_out_of_order"
            | "unallocated_number"
            | "failed"
            | "error" => TerminationReason::Failed,
            _ => TerminationReason::Other,
        }
    }

    /// Disposition implied by the reason alone, if any
    fn disposition(&self) -> Option<Disposition> {
        match self {
            TerminationReason::Busy => Some(Disposition::Busy),
            TerminationReason::Failed => Some(Disposition::Failed),
            TerminationReason::NormalClearing | TerminationReason::Other => None,
        }
    }
}

/// `end − answer` when answered, else `end − start`, never negative.
pub fn compute_duration(snapshot: &LifecycleSnapshot, end_time: DateTime<Utc>) -> Option<i32> {
    snapshot
        .answer_time
        .or(snapshot.start_time)
        .map(|from| clamped_duration_seconds(from, end_time))
}

/// Final disposition by priority. The flag is true when the answered state
/// was inferred rather than observed.
pub fn decide_disposition(
    snapshot: &LifecycleSnapshot,
    duration: Option<i32>,
    reason: TerminationReason,
    infer_answered: bool,
) -> (Disposition, bool) {
    if snapshot.disposition == Some(Disposition::Answered) || snapshot.answer_time.is_some() {
        return (Disposition::Answered, false);
    }

    if infer_answered
        && reason == TerminationReason::NormalClearing
        && duration.is_some_and(|d| d > 0)
    {
        return (Disposition::Answered, true);
    }

    (reason.disposition().unwrap_or(Disposition::NoAnswer), false)
}

/// What a reconciliation step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Applied,
    /// Valid event that deliberately changed nothing
    Skipped(&'static str),
    /// Audit-only event type
    NotReconciled,
}

pub struct Reconciler {
    store: Arc<dyn CallStore>,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CallStore>, policy: ReconcilePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    pub async fn apply(&self, event: &DecodedEvent) -> Result<Reconciled> {
        match event {
            DecodedEvent::Started(e) => self.on_started(e).await,
            DecodedEvent::Answered(e) => self.on_answered(e).await,
            DecodedEvent::Ended(e) => self.on_ended(e).await,
            DecodedEvent::UserIdentified(e) => self.on_user_identified(e).await,
            DecodedEvent::RecordingAvailable(e) => self.on_recording(e).await,
            DecodedEvent::Generic(e) => {
                debug!(event_type = %e.event_type, "No call record update for this event type");
                Ok(Reconciled::NotReconciled)
            }
        }
    }

    async fn on_started(&self, event: &CallStarted) -> Result<Reconciled> {
        self.store
            .upsert_started(&event.call_id, event.timestamp)
            .await?;

        info!(
            call_id = %event.call_id,
            caller = %event.from.as_deref().map(pii::masked_caller).unwrap_or_default(),
            "Call started recorded"
        );
        Ok(Reconciled::Applied)
    }

    async fn on_answered(&self, event: &CallAnswered) -> Result<Reconciled> {
        if !self
            .store
            .upsert_answered(&event.call_id, event.timestamp)
            .await?
        {
            info!(call_id = %event.call_id, "Answer arrived after completion, ignoring");
            return Ok(Reconciled::Skipped("already_completed"));
        }

        info!(call_id = %event.call_id, "Call answered recorded");
        Ok(Reconciled::Applied)
    }

    async fn on_ended(&self, event: &CallEnded) -> Result<Reconciled> {
        let snapshot = self
            .store
            .lifecycle_snapshot(&event.call_id)
            .await?
            .unwrap_or_default();

        let reason = TerminationReason::parse(event.termination_reason.as_deref());
        let duration = compute_duration(&snapshot, event.timestamp);
        let (disposition, inferred) =
            decide_disposition(&snapshot, duration, reason, self.policy.infer_answered);

        if inferred {
            warn!(
                call_id = %event.call_id,
                duration_seconds = duration.unwrap_or_default(),
                termination_reason = event.termination_reason.as_deref().unwrap_or(""),
                "Inferred ANSWERED from duration and normal clearing; no answer event seen"
            );
        }

        let completed = CompletedCall {
            end_time: event.timestamp,
            duration_seconds: duration,
            disposition,
        };

        if !self.store.upsert_ended(&event.call_id, &completed).await? {
            debug!(call_id = %event.call_id, "Call already completed, ignoring duplicate end");
            return Ok(Reconciled::Skipped("already_completed"));
        }

        info!(
            call_id = %event.call_id,
            disposition = %disposition,
            duration_seconds = ?duration,
            "Call completed"
        );
        Ok(Reconciled::Applied)
    }

    async fn on_user_identified(&self, event: &UserIdentified) -> Result<Reconciled> {
        let Some(user) = &event.user else {
            warn!(call_id = %event.call_id, "Identification event without user, nothing to apply");
            return Ok(Reconciled::Skipped("missing_user"));
        };

        let identity = IdentityUpdate {
            user_id: user.id.clone(),
            contact_id: event.contact.as_ref().and_then(|c| c.id),
            tenant_id: user.tenant_id.clone(),
        };

        if identity.is_empty() {
            warn!(call_id = %event.call_id, "Identification event carries no identity fields");
            return Ok(Reconciled::Skipped("empty_identity"));
        }

        if !self
            .store
            .upsert_identity(&event.call_id, &identity, self.policy.allow_late_identity)
            .await?
        {
            info!(call_id = %event.call_id, "Late identification ignored for completed call");
            return Ok(Reconciled::Skipped("already_completed"));
        }

        info!(
            call_id = %event.call_id,
            user_id = identity.user_id.as_deref().unwrap_or(""),
            tenant_id = identity.tenant_id.as_deref().unwrap_or(""),
            "Caller identified"
        );
        Ok(Reconciled::Applied)
    }

    async fn on_recording(&self, event: &RecordingAvailable) -> Result<Reconciled> {
        self.store
            .upsert_recording(&event.call_id, &event.recording_uri)
            .await?;
        info!(call_id = %event.call_id, "Recording attached");
        Ok(Reconciled::Applied)
    }
}
