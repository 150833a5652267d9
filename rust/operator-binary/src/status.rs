//! Persists the outcome of a reconcile into the reconciled object's status
//!
//! Controllers run their reconcile step to completion and hand its [`Result`] to [`commit`],
//! so that the status is written exactly once on every exit path.

use async_trait::async_trait;
use stackable_operator::kube::runtime::controller::Action;

use crate::{
    crd::Issuer,
    external_crd::cert_manager::{
        CONDITION_READY, CertificateRequest, ConditionStatus, REASON_PENDING,
    },
    store::{self, ObjectStore},
    utils::error_full_message,
};

/// Reason of all Ready conditions written for [`Issuer`]s.
pub const ISSUER_READY_REASON: &str = "IssuerHealthCheck";

/// An object with a Ready condition in its status subresource.
#[async_trait]
pub trait StatusTarget: Send {
    /// Marks the object as not ready because reconciling it failed with `message`.
    fn set_reconcile_error(&mut self, message: String);

    /// Writes the status, replacing `self` with the stored object.
    async fn write_status(&mut self, store: &dyn ObjectStore) -> Result<(), store::Error>;
}

/// Errors that can represent a failure to persist the status.
pub trait PersistFailure: std::error::Error + Sized {
    /// `reconcile_error` is the error that the reconcile step failed with, if any.
    fn persist_failed(source: store::Error, reconcile_error: Option<Self>) -> Self;
}

/// Persists `target`'s status, recording `outcome` in its Ready condition if it failed.
///
/// If the write fails then both failures are returned together.
pub async fn commit<T, E>(
    store: &dyn ObjectStore,
    target: &mut T,
    outcome: Result<Action, E>,
) -> Result<Action, E>
where
    T: StatusTarget,
    E: PersistFailure,
{
    if let Err(err) = &outcome {
        target.set_reconcile_error(error_full_message(err));
    }
    match target.write_status(store).await {
        Ok(()) => outcome,
        Err(source) => Err(E::persist_failed(source, outcome.err())),
    }
}

#[async_trait]
impl StatusTarget for CertificateRequest {
    fn set_reconcile_error(&mut self, message: String) {
        self.set_condition(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_PENDING,
            message,
        );
    }

    async fn write_status(&mut self, store: &dyn ObjectStore) -> Result<(), store::Error> {
        *self = store.update_certificate_request_status(self).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusTarget for Issuer {
    fn set_reconcile_error(&mut self, message: String) {
        self.status.get_or_insert_with(Default::default).set_ready_condition(
            ConditionStatus::False,
            ISSUER_READY_REASON,
            message,
        );
    }

    async fn write_status(&mut self, store: &dyn ObjectStore) -> Result<(), store::Error> {
        *self = store.update_issuer_status(self).await?;
        Ok(())
    }
}
