//! Employee lifecycle finalizer.
//!
//! An employee the backend serves through this employer holds the
//! employer's lifecycle finalizer, so the pod lifecycle operator waits for
//! deregistration before letting the pod go.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use consist_common::batch::{slow_start_batch, SLOW_START_INITIAL_BATCH_SIZE};
use consist_common::{Error, Result};

use super::{EmployerView, FinalizerManager};
use crate::adapter::{CudResults, EmployeeEntity};
use crate::naming::{lifecycle_finalizer, EmployeeNameSet, LIFECYCLE_FINALIZER_RECORDED_ANNOTATION};

/// Employees to give or strip the lifecycle finalizer in one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LifecycleChanges {
    /// Names to add the finalizer to, sorted
    pub to_add: Vec<String>,
    /// Names to remove the finalizer from, sorted
    pub to_delete: Vec<String>,
}

impl LifecycleChanges {
    /// Derive the changes from one employee sync.
    ///
    /// Created employees get the finalizer. Updated and unchanged employees
    /// get it when ready and lose it when not ready; those reporting no
    /// readiness are left alone. Deleted employees lose it. While the
    /// employer is being deleted nothing is added and every would-be add is
    /// a removal instead.
    pub fn from_results<T: EmployeeEntity>(results: &CudResults<T>, employer_deleting: bool) -> Self {
        let mut add = BTreeSet::new();
        let mut delete = BTreeSet::new();

        for employee in &results.succ_created {
            add.insert(employee.name().to_string());
        }
        for employee in results.succ_updated.iter().chain(&results.unchanged) {
            match employee.lifecycle_ready() {
                Some(true) => {
                    add.insert(employee.name().to_string());
                }
                Some(false) => {
                    delete.insert(employee.name().to_string());
                }
                None => {}
            }
        }
        for employee in &results.succ_deleted {
            delete.insert(employee.name().to_string());
        }

        if employer_deleting {
            delete.append(&mut add);
        }

        let mut changes = Self {
            to_add: add.into_iter().collect(),
            to_delete: Vec::new(),
        };
        changes.extend_delete(delete);
        changes
    }

    /// Add names to the removal set.
    ///
    /// A name that is also being added stays added: the same pod name can
    /// show up under an old and a new backend id in one pass.
    pub fn extend_delete(&mut self, names: impl IntoIterator<Item = String>) {
        let mut delete: BTreeSet<String> = self.to_delete.drain(..).collect();
        delete.extend(names.into_iter().filter(|n| !self.to_add.contains(n)));
        self.to_delete = delete.into_iter().collect();
    }

    /// True when nothing needs to change
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}

impl FinalizerManager {
    /// Add and remove the employer's lifecycle finalizer on employees.
    ///
    /// Both sets are processed in slow-start waves; item failures do not stop
    /// other items. All failures are returned together.
    pub async fn apply_lifecycle_finalizers(
        &self,
        employer: &EmployerView,
        changes: &LifecycleChanges,
    ) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let finalizer = lifecycle_finalizer(&employer.key.name);
        debug!(
            employer = %employer.key,
            to_add = ?changes.to_add,
            to_delete = ?changes.to_delete,
            "applying lifecycle finalizers"
        );

        let added = slow_start_batch(
            changes.to_add.len(),
            SLOW_START_INITIAL_BATCH_SIZE,
            false,
            |i, _| self.add_lifecycle_finalizer(employer, &changes.to_add[i], &finalizer),
        )
        .await;
        let removed = slow_start_batch(
            changes.to_delete.len(),
            SLOW_START_INITIAL_BATCH_SIZE,
            false,
            |i, _| self.remove_lifecycle_finalizer(employer, &changes.to_delete[i], &finalizer),
        )
        .await;

        match Error::aggregate(added.last_error.into_iter().chain(removed.last_error)) {
            Some(e) => {
                warn!(employer = %employer.key, error = %e, "lifecycle finalizer patch failed");
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Persist the names now holding the lifecycle finalizer on the employer.
    ///
    /// Only patches when the recorded set differs. Returns true when patched.
    pub async fn record_lifecycle_finalizers(
        &self,
        employer: &EmployerView,
        changes: &LifecycleChanges,
    ) -> Result<bool> {
        let recorded =
            EmployeeNameSet::parse(employer.annotation(LIFECYCLE_FINALIZER_RECORDED_ANNOTATION));
        let holding: EmployeeNameSet = changes.to_add.iter().collect();
        if recorded == holding {
            return Ok(false);
        }
        self.kube
            .patch_employer_annotation(
                &employer.key,
                LIFECYCLE_FINALIZER_RECORDED_ANNOTATION,
                &holding.to_annotation(),
            )
            .await?;
        debug!(employer = %employer.key, recorded = %holding, "recorded lifecycle finalizer holders");
        Ok(true)
    }

    async fn add_lifecycle_finalizer(
        &self,
        employer: &EmployerView,
        raw_name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let key = self.employee_key(employer, raw_name)?;
        let Some(pod) = self.kube.get_employee(&key).await? else {
            return Ok(());
        };
        // finalizers cannot be added to a terminating object
        if pod.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }
        let mut finalizers = pod.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.kube
            .replace_employee_finalizers(&key, finalizers, pod.metadata.resource_version)
            .await
    }

    async fn remove_lifecycle_finalizer(
        &self,
        employer: &EmployerView,
        raw_name: &str,
        finalizer: &str,
    ) -> Result<()> {
        let key = self.employee_key(employer, raw_name)?;
        let Some(pod) = self.kube.get_employee(&key).await? else {
            return Ok(());
        };
        let current = pod.metadata.finalizers.unwrap_or_default();
        if !current.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let remaining = current.into_iter().filter(|f| f != finalizer).collect();
        self.kube
            .replace_employee_finalizers(&key, remaining, pod.metadata.resource_version)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::predicate::*;

    use super::*;
    use crate::adapter::{Entity, PodEmployee, PodEmployeeStatuses};
    use crate::client::{EmployerKey, MockConsistKubeClient};
    use crate::cluster::{ClusterRoute, EmployeeRouting};

    const WEB_FINALIZER: &str = "prot.podopslifecycle.kusionstack.io/9705eb7ac2c98403";

    fn employee(name: &str, ready: bool) -> PodEmployee {
        PodEmployee {
            id: format!("id-{name}"),
            name: name.to_string(),
            statuses: PodEmployeeStatuses {
                lifecycle_ready: ready,
                ..Default::default()
            },
        }
    }

    #[derive(Clone, Debug)]
    struct Silent(String);

    impl Entity for Silent {
        type Status = ();
        fn id(&self) -> &str {
            &self.0
        }
        fn status(&self) -> &() {
            &()
        }
        fn equals(&self, _other: &Self) -> Result<bool> {
            Ok(true)
        }
    }

    impl EmployeeEntity for Silent {
        fn name(&self) -> &str {
            &self.0
        }
    }

    fn view(annotation: Option<&str>) -> EmployerView {
        let mut view = EmployerView {
            key: EmployerKey {
                kind: "Service".into(),
                namespace: "default".into(),
                name: "web".into(),
            },
            ..Default::default()
        };
        if let Some(value) = annotation {
            view.annotations
                .insert(LIFECYCLE_FINALIZER_RECORDED_ANNOTATION.into(), value.into());
        }
        view
    }

    fn pod(finalizers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                resource_version: Some("11".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Story: newly registered employees get the lifecycle finalizer
    #[test]
    fn story_created_employees_are_added() {
        let results = CudResults {
            succ_created: vec![employee("p1", true), employee("p2", true)],
            ..Default::default()
        };
        let changes = LifecycleChanges::from_results(&results, false);
        assert_eq!(changes.to_add, vec!["p1", "p2"]);
        assert!(changes.to_delete.is_empty());
    }

    /// Story: a deregistered employee loses the lifecycle finalizer
    #[test]
    fn story_deleted_employee_is_removed() {
        let results = CudResults {
            succ_deleted: vec![employee("p3", true)],
            unchanged: vec![employee("p1", true)],
            ..Default::default()
        };
        let changes = LifecycleChanges::from_results(&results, false);
        assert_eq!(changes.to_add, vec!["p1"]);
        assert_eq!(changes.to_delete, vec!["p3"]);
    }

    #[test]
    fn readiness_decides_updated_and_unchanged() {
        let results = CudResults {
            succ_updated: vec![employee("up-ready", true), employee("up-unready", false)],
            unchanged: vec![employee("same-ready", true), employee("same-unready", false)],
            fail_updated: vec![employee("failed", true)],
            ..Default::default()
        };
        let changes = LifecycleChanges::from_results(&results, false);
        assert_eq!(changes.to_add, vec!["same-ready", "up-ready"]);
        assert_eq!(changes.to_delete, vec!["same-unready", "up-unready"]);
    }

    #[test]
    fn employees_without_readiness_are_left_alone() {
        let results = CudResults {
            succ_updated: vec![Silent("a".into())],
            unchanged: vec![Silent("b".into())],
            succ_created: vec![Silent("c".into())],
            ..Default::default()
        };
        let changes = LifecycleChanges::from_results(&results, false);
        assert_eq!(changes.to_add, vec!["c"]);
        assert!(changes.to_delete.is_empty());
    }

    #[test]
    fn deleting_employer_turns_adds_into_removals() {
        let results = CudResults {
            succ_created: vec![employee("p1", true)],
            unchanged: vec![employee("p2", true)],
            succ_deleted: vec![employee("p3", true)],
            ..Default::default()
        };
        let changes = LifecycleChanges::from_results(&results, true);
        assert!(changes.to_add.is_empty());
        assert_eq!(changes.to_delete, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn name_in_both_sets_stays_added() {
        let results = CudResults {
            succ_created: vec![employee("p1", true)],
            succ_deleted: vec![PodEmployee {
                id: "old-ip".into(),
                ..employee("p1", true)
            }],
            ..Default::default()
        };
        let mut changes = LifecycleChanges::from_results(&results, false);
        assert_eq!(changes.to_add, vec!["p1"]);
        assert!(changes.to_delete.is_empty());

        changes.extend_delete(vec!["p1".to_string(), "p9".to_string(), "p9".to_string()]);
        assert_eq!(changes.to_delete, vec!["p9"]);
    }

    #[tokio::test]
    async fn adds_finalizer_once_and_keeps_others() {
        let mut mock = MockConsistKubeClient::new();
        mock.expect_get_employee()
            .returning(|key| Ok(Some(pod(if key.name == "p1" { &["x"] } else { &[WEB_FINALIZER] }))));
        mock.expect_replace_employee_finalizers()
            .with(
                function(|key: &crate::client::EmployeeKey| key.name == "p1"),
                eq(vec!["x".to_string(), WEB_FINALIZER.to_string()]),
                eq(Some("11".to_string())),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));

        let manager = FinalizerManager::new(Arc::new(mock), EmployeeRouting::SingleCluster);
        let changes = LifecycleChanges {
            to_add: vec!["p1".into(), "p2".into()],
            to_delete: vec![],
        };
        manager
            .apply_lifecycle_finalizers(&view(None), &changes)
            .await
            .expect("apply");
    }

    #[tokio::test]
    async fn removal_skips_missing_pods_and_absent_finalizer() {
        let mut mock = MockConsistKubeClient::new();
        mock.expect_get_employee().returning(|key| match key.name.as_str() {
            "gone" => Ok(None),
            "bare" => Ok(Some(pod(&["x"]))),
            _ => Ok(Some(pod(&["x", WEB_FINALIZER]))),
        });
        mock.expect_replace_employee_finalizers()
            .with(
                function(|key: &crate::client::EmployeeKey| key.name == "held"),
                eq(vec!["x".to_string()]),
                always(),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));

        let manager = FinalizerManager::new(Arc::new(mock), EmployeeRouting::SingleCluster);
        let changes = LifecycleChanges {
            to_add: vec![],
            to_delete: vec!["bare".into(), "gone".into(), "held".into()],
        };
        manager
            .apply_lifecycle_finalizers(&view(None), &changes)
            .await
            .expect("apply");
    }

    #[tokio::test]
    async fn failed_add_does_not_stop_removals() {
        let mut mock = MockConsistKubeClient::new();
        mock.expect_get_employee().returning(|key| match key.name.as_str() {
            "p1" => Err(Error::internal("api down")),
            _ => Ok(Some(pod(&[WEB_FINALIZER]))),
        });
        mock.expect_replace_employee_finalizers()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let manager = FinalizerManager::new(Arc::new(mock), EmployeeRouting::SingleCluster);
        let changes = LifecycleChanges {
            to_add: vec!["p1".into()],
            to_delete: vec!["p2".into()],
        };
        let err = manager
            .apply_lifecycle_finalizers(&view(None), &changes)
            .await
            .expect_err("should fail");
        assert!(matches!(err, Error::Internal { .. }));
    }

    /// Story: under local routing the pod is patched on its own cluster
    #[tokio::test]
    async fn story_local_routing_patches_member_cluster() {
        let mut mock = MockConsistKubeClient::new();
        mock.expect_get_employee()
            .withf(|key| key.route == ClusterRoute::Member("clusterA".into()) && key.name == "p1")
            .returning(|_| Ok(Some(pod(&[]))));
        mock.expect_replace_employee_finalizers()
            .withf(|key, _, _| key.route == ClusterRoute::Member("clusterA".into()))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let manager = FinalizerManager::new(Arc::new(mock), EmployeeRouting::Local);
        let changes = LifecycleChanges {
            to_add: vec!["p1#clusterA".into()],
            to_delete: vec![],
        };
        manager
            .apply_lifecycle_finalizers(&view(None), &changes)
            .await
            .expect("apply");
    }

    #[tokio::test]
    async fn records_holders_only_when_changed() {
        let mut mock = MockConsistKubeClient::new();
        mock.expect_patch_employer_annotation()
            .withf(|_, annotation, value| {
                annotation == LIFECYCLE_FINALIZER_RECORDED_ANNOTATION && value == "p1,p2"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let manager = FinalizerManager::new(Arc::new(mock), EmployeeRouting::SingleCluster);

        let changes = LifecycleChanges {
            to_add: vec!["p2".into(), "p1".into()],
            to_delete: vec![],
        };
        assert!(manager
            .record_lifecycle_finalizers(&view(Some("p1")), &changes)
            .await
            .expect("record"));
        assert!(!manager
            .record_lifecycle_finalizers(&view(Some("p2,p1")), &changes)
            .await
            .expect("record"));
    }

    #[tokio::test]
    async fn empty_holder_set_is_written_as_empty_string() {
        let mut mock = MockConsistKubeClient::new();
        mock.expect_patch_employer_annotation()
            .withf(|_, annotation, value| {
                annotation == LIFECYCLE_FINALIZER_RECORDED_ANNOTATION && value.is_empty()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let manager = FinalizerManager::new(Arc::new(mock), EmployeeRouting::SingleCluster);

        let changes = LifecycleChanges::default();
        assert!(manager
            .record_lifecycle_finalizers(&view(Some("p1")), &changes)
            .await
            .expect("record"));
        assert!(!manager
            .record_lifecycle_finalizers(&view(None), &changes)
            .await
            .expect("record"));
    }
}
