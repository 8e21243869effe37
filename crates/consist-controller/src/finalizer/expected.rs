//! Expected-finalizer handshake.
//!
//! Each selected pod carries, in its availability annotation, a token per
//! employer that expects to guard it. The admission webhook seeds the token
//! at pod creation; this module catches up afterwards and withdraws the
//! token when the pod is deselected or the employer goes away.

use tracing::{debug, warn};

use consist_common::batch::{slow_start_batch, SLOW_START_INITIAL_BATCH_SIZE};
use consist_common::{Error, Result};

use super::{EmployerView, FinalizerManager};
use crate::naming::{
    expected_finalizer_key, lifecycle_finalizer, AvailableConditions, EmployeeNameSet,
    EXPECTED_FINALIZER_ADDED_ANNOTATION, POD_AVAILABLE_CONDITIONS_ANNOTATION,
};

/// One employee's token operation and whether it took effect
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedFinalizerOp {
    /// Raw employee name
    pub name: String,
    /// Set once the employee is known to be in the requested state
    pub succeeded: bool,
}

impl ExpectedFinalizerOp {
    fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            succeeded: false,
        }
    }
}

fn pending_ops<I, S>(names: I) -> Vec<ExpectedFinalizerOp>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(ExpectedFinalizerOp::pending).collect()
}

/// Employer-side identity of the token
struct Token {
    key: String,
    value: String,
}

impl Token {
    fn of(employer: &EmployerView) -> Self {
        Self {
            key: expected_finalizer_key(
                &employer.key.kind,
                &employer.key.namespace,
                &employer.key.name,
            ),
            value: lifecycle_finalizer(&employer.key.name),
        }
    }
}

impl FinalizerManager {
    /// Run the handshake for the employees `employer` currently selects.
    ///
    /// With `recorded`, the set of employees holding the token is persisted
    /// on the employer and only the difference is patched; otherwise every
    /// selected employee is visited each pass. Returns whether the handshake
    /// is clean, i.e. whether a deleting employer has no token left out.
    pub async fn ensure_expected_finalizers(
        &self,
        employer: &EmployerView,
        selected: Vec<String>,
        recorded: bool,
    ) -> Result<bool> {
        if recorded {
            self.ensure_expected_recorded(employer, selected).await
        } else {
            self.ensure_expected_not_recorded(employer, selected).await
        }
    }

    async fn ensure_expected_not_recorded(
        &self,
        employer: &EmployerView,
        selected: Vec<String>,
    ) -> Result<bool> {
        if employer.deleting {
            let mut to_delete = pending_ops(selected);
            let patched = self.patch_expected_finalizers(employer, &mut [], &mut to_delete).await;
            let clean = to_delete.iter().all(|op| op.succeeded);
            patched?;
            return Ok(clean);
        }

        let mut to_add = pending_ops(selected);
        self.patch_expected_finalizers(employer, &mut to_add, &mut [])
            .await?;
        Ok(to_add.iter().any(|op| op.succeeded))
    }

    async fn ensure_expected_recorded(
        &self,
        employer: &EmployerView,
        selected: Vec<String>,
    ) -> Result<bool> {
        let recorded =
            EmployeeNameSet::parse(employer.annotation(EXPECTED_FINALIZER_ADDED_ANNOTATION));
        let selected: EmployeeNameSet = selected.into_iter().collect();

        if employer.deleting {
            let mut to_delete = pending_ops(recorded.union(&selected));
            if let Err(e) = self.patch_expected_finalizers(employer, &mut [], &mut to_delete).await {
                warn!(employer = %employer.key, error = %e, "withdrawing expected finalizers failed");
            }
            let remaining: EmployeeNameSet = to_delete
                .into_iter()
                .filter(|op| !op.succeeded)
                .map(|op| op.name)
                .collect();
            self.record_expected_finalizers(employer, &recorded, &remaining)
                .await?;
            return Ok(remaining.is_empty());
        }

        let mut to_delete = pending_ops(recorded.difference(&selected));
        let mut to_add = pending_ops(selected.difference(&recorded));
        debug!(
            employer = %employer.key,
            to_add = ?to_add.iter().map(|op| &op.name).collect::<Vec<_>>(),
            to_delete = ?to_delete.iter().map(|op| &op.name).collect::<Vec<_>>(),
            "syncing expected finalizers"
        );
        let patched = self
            .patch_expected_finalizers(employer, &mut to_add, &mut to_delete)
            .await;

        let mut added = recorded.clone();
        for op in to_delete.iter().filter(|op| op.succeeded) {
            added.remove(&op.name);
        }
        for op in to_add.iter().filter(|op| op.succeeded) {
            added.insert(op.name.clone());
        }
        let persisted = self
            .record_expected_finalizers(employer, &recorded, &added)
            .await;

        match Error::aggregate(patched.err().into_iter().chain(persisted.err())) {
            Some(e) => Err(e),
            None => Ok(added == selected),
        }
    }

    async fn record_expected_finalizers(
        &self,
        employer: &EmployerView,
        recorded: &EmployeeNameSet,
        holding: &EmployeeNameSet,
    ) -> Result<()> {
        if recorded == holding {
            return Ok(());
        }
        self.kube
            .patch_employer_annotation(
                &employer.key,
                EXPECTED_FINALIZER_ADDED_ANNOTATION,
                &holding.to_annotation(),
            )
            .await?;
        debug!(employer = %employer.key, recorded = %holding, "recorded expected finalizer holders");
        Ok(())
    }

    /// Add and withdraw tokens, marking each op that took effect.
    ///
    /// Every item is attempted; the failures of both directions are returned
    /// together after all waves have drained.
    async fn patch_expected_finalizers(
        &self,
        employer: &EmployerView,
        to_add: &mut [ExpectedFinalizerOp],
        to_delete: &mut [ExpectedFinalizerOp],
    ) -> Result<()> {
        let token = Token::of(employer);

        let added = slow_start_batch(to_add.len(), SLOW_START_INITIAL_BATCH_SIZE, false, |i, _| {
            self.add_expected_token(employer, &to_add[i].name, &token)
        })
        .await;
        for (i, op) in to_add.iter_mut().enumerate() {
            op.succeeded = added.output(i).copied().unwrap_or(false);
        }

        let removed = slow_start_batch(to_delete.len(), SLOW_START_INITIAL_BATCH_SIZE, false, |i, _| {
            self.remove_expected_token(employer, &to_delete[i].name, &token)
        })
        .await;
        for (i, op) in to_delete.iter_mut().enumerate() {
            op.succeeded = removed.output(i).copied().unwrap_or(false);
        }

        match Error::aggregate(added.last_error.into_iter().chain(removed.last_error)) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Put the token on one pod. Returns whether the pod now holds it.
    ///
    /// A missing or terminating pod is not an error, but does not count as
    /// holding the token.
    async fn add_expected_token(
        &self,
        employer: &EmployerView,
        raw_name: &str,
        token: &Token,
    ) -> Result<bool> {
        let key = self.employee_key(employer, raw_name)?;
        let Some(pod) = self.kube.get_employee(&key).await? else {
            return Ok(false);
        };
        if pod.metadata.deletion_timestamp.is_some() {
            return Ok(false);
        }

        let annotations = pod.metadata.annotations.unwrap_or_default();
        let mut conditions = AvailableConditions::parse(
            annotations
                .get(POD_AVAILABLE_CONDITIONS_ANNOTATION)
                .map(String::as_str),
        )?;
        if conditions.insert_expected(&token.key, &token.value) {
            self.kube
                .patch_employee_annotation(
                    &key,
                    POD_AVAILABLE_CONDITIONS_ANNOTATION,
                    &conditions.to_annotation()?,
                )
                .await?;
        }
        Ok(true)
    }

    /// Withdraw the token from one pod. Returns whether the pod is now without it.
    async fn remove_expected_token(
        &self,
        employer: &EmployerView,
        raw_name: &str,
        token: &Token,
    ) -> Result<bool> {
        let key = self.employee_key(employer, raw_name)?;
        let Some(pod) = self.kube.get_employee(&key).await? else {
            return Ok(true);
        };

        let annotations = pod.metadata.annotations.unwrap_or_default();
        let raw = match annotations.get(POD_AVAILABLE_CONDITIONS_ANNOTATION) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Ok(true),
        };
        let mut conditions = AvailableConditions::parse(Some(raw))?;
        if conditions.remove_expected(&token.key) {
            self.kube
                .patch_employee_annotation(
                    &key,
                    POD_AVAILABLE_CONDITIONS_ANNOTATION,
                    &conditions.to_annotation()?,
                )
                .await?;
        }
        Ok(true)
    }
}
