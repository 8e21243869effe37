//! Employer clean finalizer.

use tracing::{debug, info};

use consist_common::Result;

use super::{EmployerView, FinalizerManager};
use crate::client::EmployerKey;
use crate::naming::clean_finalizer;

impl FinalizerManager {
    /// Add the clean finalizer to a live employer that lacks it.
    ///
    /// Returns true when the finalizer was added in this call. A deleting
    /// employer never gets it back.
    pub async fn ensure_clean_finalizer(&self, employer: &EmployerView) -> Result<bool> {
        if employer.deleting {
            return Ok(false);
        }
        let finalizer = clean_finalizer(&employer.key.name);
        if employer.has_finalizer(&finalizer) {
            return Ok(false);
        }

        let mut finalizers = employer.finalizers.clone();
        finalizers.push(finalizer);
        self.kube
            .replace_employer_finalizers(&employer.key, finalizers, employer.resource_version.clone())
            .await?;
        info!(employer = %employer.key, "added employer clean finalizer");
        Ok(true)
    }

    /// Remove the clean finalizer from the latest version of the employer.
    ///
    /// Returns true when a patch was sent. A vanished employer or one without
    /// the finalizer is already clean.
    pub async fn remove_clean_finalizer(&self, key: &EmployerKey) -> Result<bool> {
        let Some(meta) = self.kube.get_employer_meta(key).await? else {
            debug!(employer = %key, "employer gone before clean finalizer removal");
            return Ok(false);
        };

        let finalizer = clean_finalizer(&key.name);
        let current = meta.finalizers.unwrap_or_default();
        if !current.contains(&finalizer) {
            return Ok(false);
        }

        let remaining: Vec<String> = current.into_iter().filter(|f| *f != finalizer).collect();
        self.kube
            .replace_employer_finalizers(key, remaining, meta.resource_version)
            .await?;
        info!(employer = %key, "removed employer clean finalizer");
        Ok(true)
    }
}
