//! Shipment state reconciliation.
//!
//! Provider webhooks arrive late, twice, or out of order. Each one is decided
//! against the stored shipment and committed with a version check; a lost race
//! re-reads and decides again, so a stale forward check never lands.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use vayva_core::{ExpectedVersion, ShipmentId, TenantId};
use vayva_shipments::{
    CanonicalStatus, CourierInfo, Provider, Shipment, Transition, WebhookMove, translate,
};

use crate::config::ReliabilityConfig;
use crate::store::{ShipmentStore, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("shipment not found: {0}")]
    NotFound(String),

    #[error("cannot move shipment from {from} to {to}")]
    InvalidTransition {
        from: CanonicalStatus,
        to: CanonicalStatus,
    },

    #[error("shipment {0} kept changing; gave up after repeated version conflicts")]
    Contention(ShipmentId),

    #[error("invalid shipment: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a reported status left the shipment untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Duplicate,
    OutOfOrder,
    Terminal,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::Duplicate => "duplicate",
            IgnoreReason::OutOfOrder => "out_of_order",
            IgnoreReason::Terminal => "terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(Shipment),
    Ignored {
        reason: IgnoreReason,
        shipment: Shipment,
    },
}

impl ApplyOutcome {
    pub fn shipment(&self) -> &Shipment {
        match self {
            ApplyOutcome::Applied(shipment) => shipment,
            ApplyOutcome::Ignored { shipment, .. } => shipment,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied(_) => "applied",
            ApplyOutcome::Ignored { reason, .. } => reason.as_str(),
        }
    }
}

/// Result of a provider webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Reconciled(ApplyOutcome),
    /// The raw status is not in the provider's vocabulary.
    UnknownStatus { raw_status: String },
}

impl WebhookOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Reconciled(outcome) => outcome.label(),
            WebhookOutcome::UnknownStatus { .. } => "unknown_status",
        }
    }
}

/// Optional metadata carried alongside a status update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub note: Option<String>,
    pub courier: Option<CourierInfo>,
    pub tracking_code: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
}

pub struct ShipmentReconciler<S> {
    store: S,
    max_retries: u32,
}

impl<S: ShipmentStore> ShipmentReconciler<S> {
    pub fn new(store: S, config: &ReliabilityConfig) -> Self {
        Self {
            store,
            max_retries: config.reconcile_max_retries.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register a new shipment in `Requested`.
    pub async fn create(
        &self,
        owner_id: Option<TenantId>,
        order_ref: &str,
        provider: Provider,
        tracking_code: Option<String>,
    ) -> Result<Shipment, ReconcileError> {
        let shipment = Shipment::requested(
            ShipmentId::new(),
            owner_id,
            order_ref,
            provider,
            tracking_code,
            Utc::now(),
        )
        .map_err(|e| ReconcileError::Invalid(e.to_string()))?;

        self.store.insert(&shipment).await?;
        info!(
            shipment_id = %shipment.id,
            provider = %provider,
            order_ref = %shipment.order_ref,
            "shipment created"
        );
        Ok(shipment)
    }

    pub async fn get(&self, id: ShipmentId) -> Result<Shipment, ReconcileError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(id.to_string()))
    }

    /// Reconcile a provider-reported raw status for the shipment with `tracking_code`.
    pub async fn apply_webhook(
        &self,
        provider: Provider,
        tracking_code: &str,
        raw_status: &str,
        update: StatusUpdate,
    ) -> Result<WebhookOutcome, ReconcileError> {
        let shipment = self
            .store
            .find_by_tracking_code(provider, tracking_code)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(format!("{provider}/{tracking_code}")))?;

        let Some(status) = translate(provider, raw_status) else {
            info!(
                shipment_id = %shipment.id,
                provider = %provider,
                raw_status,
                "ignoring unmapped provider status"
            );
            return Ok(WebhookOutcome::UnknownStatus {
                raw_status: raw_status.to_string(),
            });
        };

        let outcome = self
            .apply(shipment.id, status, Some(raw_status.trim().to_string()), update)
            .await?;
        Ok(WebhookOutcome::Reconciled(outcome))
    }

    /// Apply a webhook-reported canonical status.
    ///
    /// Duplicates, backwards moves and moves out of a terminal state are
    /// ignored, not errors.
    pub async fn apply(
        &self,
        shipment_id: ShipmentId,
        status: CanonicalStatus,
        raw_status: Option<String>,
        update: StatusUpdate,
    ) -> Result<ApplyOutcome, ReconcileError> {
        for _ in 0..self.max_retries {
            let current = self.get(shipment_id).await?;

            let reason = match current.decide_webhook(status) {
                WebhookMove::Advance => None,
                WebhookMove::Duplicate => Some(IgnoreReason::Duplicate),
                WebhookMove::OutOfOrder => Some(IgnoreReason::OutOfOrder),
                WebhookMove::Terminal => Some(IgnoreReason::Terminal),
            };
            if let Some(reason) = reason {
                match reason {
                    IgnoreReason::Duplicate => debug!(
                        shipment_id = %shipment_id,
                        status = %status,
                        "duplicate status ignored"
                    ),
                    IgnoreReason::OutOfOrder => info!(
                        shipment_id = %shipment_id,
                        current = %current.status(),
                        reported = %status,
                        "out-of-order status ignored"
                    ),
                    IgnoreReason::Terminal => warn!(
                        shipment_id = %shipment_id,
                        current = %current.status(),
                        reported = %status,
                        "status reported for shipment in terminal state"
                    ),
                }
                return Ok(ApplyOutcome::Ignored {
                    reason,
                    shipment: current,
                });
            }

            let occurred_at = update.occurred_at.unwrap_or_else(Utc::now);
            let transition = Transition {
                raw_status: raw_status.clone(),
                ..Transition::webhook(status, String::new(), occurred_at)
            }
            .with_note(update.note.clone())
            .with_courier(update.courier.clone())
            .with_tracking_code(update.tracking_code.clone());

            if let Some(updated) = self.commit(current, &transition).await? {
                info!(
                    shipment_id = %shipment_id,
                    status = %status,
                    version = updated.version,
                    "shipment status advanced"
                );
                return Ok(ApplyOutcome::Applied(updated));
            }
        }

        warn!(shipment_id = %shipment_id, "gave up reconciling after version conflicts");
        Err(ReconcileError::Contention(shipment_id))
    }

    /// Operator-driven move, checked against the manual allow-list.
    pub async fn transition_manual(
        &self,
        shipment_id: ShipmentId,
        to: CanonicalStatus,
        update: StatusUpdate,
    ) -> Result<Shipment, ReconcileError> {
        for _ in 0..self.max_retries {
            let current = self.get(shipment_id).await?;
            if current.check_manual(to).is_err() {
                return Err(ReconcileError::InvalidTransition {
                    from: current.status(),
                    to,
                });
            }

            let transition = Transition::manual(to, update.occurred_at.unwrap_or_else(Utc::now))
                .with_note(update.note.clone())
                .with_courier(update.courier.clone())
                .with_tracking_code(update.tracking_code.clone());

            if let Some(updated) = self.commit(current, &transition).await? {
                info!(
                    shipment_id = %shipment_id,
                    status = %to,
                    version = updated.version,
                    "shipment status changed by operator"
                );
                return Ok(updated);
            }
        }

        Err(ReconcileError::Contention(shipment_id))
    }

    /// `None` when another writer committed first.
    async fn commit(
        &self,
        mut shipment: Shipment,
        transition: &Transition,
    ) -> Result<Option<Shipment>, ReconcileError> {
        let expected = ExpectedVersion::Exact(shipment.version);
        shipment.apply_transition(transition);
        match self.store.commit_transition(&shipment, expected).await {
            Ok(()) => Ok(Some(shipment)),
            Err(StoreError::Concurrency(reason)) => {
                debug!(shipment_id = %shipment.id, %reason, "version conflict, re-reading");
                Ok(None)
            }
            // Re-reading cannot free a tracking code another shipment holds.
            Err(StoreError::Duplicate(reason)) => Err(ReconcileError::Invalid(reason)),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;
    use vayva_shipments::EventSource;

    use super::*;
    use crate::store::InMemoryStore;

    use CanonicalStatus::*;

    async fn setup() -> (ShipmentReconciler<Arc<InMemoryStore>>, Shipment) {
        let reconciler = ShipmentReconciler::new(InMemoryStore::arc(), &ReliabilityConfig::default());
        let shipment = reconciler
            .create(Some(TenantId::new()), "ORD-100", Provider::Kwik, Some("KW-100".into()))
            .await
            .unwrap();
        (reconciler, shipment)
    }

    async fn webhook(
        reconciler: &ShipmentReconciler<Arc<InMemoryStore>>,
        raw: &str,
    ) -> WebhookOutcome {
        reconciler
            .apply_webhook(Provider::Kwik, "KW-100", raw, StatusUpdate::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn started_moves_accepted_shipment_in_transit_once() {
        let (reconciler, shipment) = setup().await;
        assert_eq!(webhook(&reconciler, "ACCEPTED").await.label(), "applied");

        let outcome = webhook(&reconciler, "STARTED").await;
        assert_eq!(outcome.label(), "applied");

        let stored = reconciler.get(shipment.id).await.unwrap();
        assert_eq!(stored.status(), InTransit);
        assert_eq!(stored.provider_raw_status.as_deref(), Some("STARTED"));
        assert_eq!(stored.history.len(), 3);
        assert_eq!(stored.last_event().unwrap().source, EventSource::Webhook);

        let replay = webhook(&reconciler, "STARTED").await;
        assert_eq!(replay.label(), "duplicate");
        assert_eq!(reconciler.get(shipment.id).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn late_status_after_delivery_changes_nothing() {
        let (reconciler, shipment) = setup().await;
        reconciler
            .apply(shipment.id, Delivered, Some("ENDED".into()), StatusUpdate::default())
            .await
            .unwrap();
        let before = reconciler.get(shipment.id).await.unwrap();

        let outcome = reconciler
            .apply(shipment.id, InTransit, Some("STARTED".into()), StatusUpdate::default())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ApplyOutcome::Ignored { reason: IgnoreReason::Terminal, .. }
        ));
        assert_eq!(reconciler.get(shipment.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn backwards_status_is_out_of_order() {
        let (reconciler, shipment) = setup().await;
        webhook(&reconciler, "PICKED_UP").await;

        let outcome = webhook(&reconciler, "ACCEPTED").await;
        assert_eq!(outcome.label(), "out_of_order");
        assert_eq!(reconciler.get(shipment.id).await.unwrap().status(), PickedUp);
    }

    #[tokio::test]
    async fn unmapped_status_mutates_nothing() {
        let (reconciler, shipment) = setup().await;
        let outcome = webhook(&reconciler, "TELEPORTED").await;
        assert_eq!(
            outcome,
            WebhookOutcome::UnknownStatus { raw_status: "TELEPORTED".into() }
        );
        assert_eq!(reconciler.get(shipment.id).await.unwrap(), shipment);
    }

    #[tokio::test]
    async fn unknown_tracking_code_is_not_found() {
        let (reconciler, _) = setup().await;
        let err = reconciler
            .apply_webhook(Provider::Kwik, "NOPE", "STARTED", StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound(_)));
    }

    #[tokio::test]
    async fn courier_details_fill_in_without_erasing() {
        let (reconciler, shipment) = setup().await;
        let first = StatusUpdate {
            courier: Some(CourierInfo {
                name: Some("Ada".into()),
                phone: Some("+2348000000000".into()),
                tracking_url: None,
            }),
            ..StatusUpdate::default()
        };
        reconciler.apply(shipment.id, Accepted, None, first).await.unwrap();

        let second = StatusUpdate {
            courier: Some(CourierInfo {
                name: None,
                phone: None,
                tracking_url: Some("https://track.example/KW-100".into()),
            }),
            note: Some("rider en route".into()),
            ..StatusUpdate::default()
        };
        let outcome = reconciler.apply(shipment.id, PickedUp, None, second).await.unwrap();

        let stored = outcome.shipment();
        assert_eq!(stored.courier.name.as_deref(), Some("Ada"));
        assert_eq!(
            stored.courier.tracking_url.as_deref(),
            Some("https://track.example/KW-100")
        );
        assert_eq!(stored.last_event().unwrap().note.as_deref(), Some("rider en route"));
    }

    #[tokio::test]
    async fn manual_transitions_follow_allow_list() {
        let (reconciler, shipment) = setup().await;

        let err = reconciler
            .transition_manual(shipment.id, Delivered, StatusUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err, ReconcileError::InvalidTransition { from: Requested, to: Delivered });

        let accepted = reconciler
            .transition_manual(shipment.id, Accepted, StatusUpdate::default())
            .await
            .unwrap();
        assert_eq!(accepted.last_event().unwrap().source, EventSource::Manual);

        reconciler
            .transition_manual(shipment.id, Canceled, StatusUpdate::default())
            .await
            .unwrap();
        let err = reconciler
            .transition_manual(shipment.id, Accepted, StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTransition { from: Canceled, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_webhooks_append_one_event() {
        const WRITERS: usize = 16;
        let (reconciler, shipment) = setup().await;
        let reconciler = Arc::new(reconciler);
        let barrier = Arc::new(tokio::sync::Barrier::new(WRITERS));

        let mut handles = Vec::new();
        for _ in 0..WRITERS {
            let reconciler = reconciler.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                reconciler
                    .apply(shipment.id, Accepted, Some("ACCEPTED".into()), StatusUpdate::default())
                    .await
            }));
        }

        let mut applied = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(ApplyOutcome::Applied(_)) => applied += 1,
                Ok(ApplyOutcome::Ignored { reason: IgnoreReason::Duplicate, .. }) => duplicates += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(duplicates, WRITERS - 1);
        let stored = reconciler.get(shipment.id).await.unwrap();
        let accepted_events = stored.history.iter().filter(|e| e.status == Accepted).count();
        assert_eq!(accepted_events, 1);
        assert_eq!(stored.history.len(), 2);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn tracking_code_taken_by_another_shipment_is_invalid() {
        let (reconciler, _) = setup().await;
        let other = reconciler
            .create(Some(TenantId::new()), "ORD-200", Provider::Kwik, None)
            .await
            .unwrap();

        let update = StatusUpdate {
            tracking_code: Some("KW-100".into()),
            ..StatusUpdate::default()
        };
        let err = reconciler
            .transition_manual(other.id, Accepted, update)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Invalid(_)), "{err:?}");

        let stored = reconciler.get(other.id).await.unwrap();
        assert_eq!(stored.status(), Requested);
        assert!(stored.external_tracking_code.is_none());
    }

    fn any_status() -> impl Strategy<Value = CanonicalStatus> {
        proptest::sample::select(CanonicalStatus::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn webhook_sequences_never_regress(statuses in proptest::collection::vec(any_status(), 0..24)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (reconciler, shipment) = setup().await;
                let mut applied = 0usize;
                let mut previous = shipment.status();

                for status in statuses {
                    let outcome = reconciler
                        .apply(shipment.id, status, None, StatusUpdate::default())
                        .await
                        .unwrap();
                    let current = outcome.shipment().status();

                    if outcome.is_applied() {
                        applied += 1;
                    } else {
                        assert_eq!(current, previous);
                    }
                    if let (Some(before), Some(after)) = (previous.forward_rank(), current.forward_rank()) {
                        assert!(after >= before, "{previous} -> {current}");
                    }
                    if previous.is_terminal() {
                        assert_eq!(current, previous);
                    }
                    previous = current;
                }

                let stored = reconciler.get(shipment.id).await.unwrap();
                assert_eq!(stored.history.len(), applied + 1);
                assert_eq!(stored.version as usize, applied + 1);
            });
        }
    }
}
