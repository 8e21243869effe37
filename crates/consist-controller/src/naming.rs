//! Persisted state: annotation keys, finalizer names and their encodings.
//!
//! These values live on already-deployed objects and are read by other
//! components (the pod lifecycle operator, older controller versions), so
//! every string here is wire format. Inside the controller they are handled
//! as typed sets and maps and only encoded at the object boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use consist_common::{Error, Result};

/// Employer annotation listing employees holding this employer's lifecycle finalizer
pub const LIFECYCLE_FINALIZER_RECORDED_ANNOTATION: &str =
    "resource-consist.kusionstack.io/employees-lifecycle-finalizer-recorded";

/// Employer annotation listing employees holding this employer's expected-finalizer token
pub const EXPECTED_FINALIZER_ADDED_ANNOTATION: &str =
    "resource-consist.kusionstack.io/employees-expected-finalizer-added";

/// Prefix of the employer clean finalizer; the employer name is appended
pub const CLEAN_FINALIZER_PREFIX: &str = "resource-consist.kusionstack.io/clean-";

/// Pod annotation holding the availability conditions JSON
pub const POD_AVAILABLE_CONDITIONS_ANNOTATION: &str = "pod.kusionstack.io/available-conditions";

/// Finalizer domain of the pod operation protection finalizers
pub const POD_OPERATION_PROTECTION_FINALIZER_PREFIX: &str = "prot.podopslifecycle.kusionstack.io";

/// Label marking a pod as ready to receive traffic from its employers
pub const POD_SERVICE_AVAILABLE_LABEL: &str = "kusionstack.io/service-available";

/// Label an employer carries when it is managed by a consist controller
pub const CONTROLLED_BY_LABEL: &str = "kusionstack.io/control";

/// Field manager used for every patch this framework sends
pub const FIELD_MANAGER: &str = "resource-consist-controller";

/// Clean finalizer of the named employer
pub fn clean_finalizer(employer_name: &str) -> String {
    format!("{CLEAN_FINALIZER_PREFIX}{employer_name}")
}

/// Lifecycle finalizer / expected-finalizer token of the named employer.
///
/// The same value guards the pod (as a finalizer) and is written into the
/// pod's availability annotation (as the expected token): the prefix plus
/// hex characters 8..24 of the MD5 digest of the employer name.
pub fn lifecycle_finalizer(employer_name: &str) -> String {
    let digest = format!("{:x}", md5::compute(employer_name.as_bytes()));
    format!("{POD_OPERATION_PROTECTION_FINALIZER_PREFIX}/{}", &digest[8..24])
}

/// Key of an employer inside a pod's expected-finalizers map: `Kind/namespace/name`
pub fn expected_finalizer_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("{kind}/{namespace}/{name}")
}

/// Set of employee names persisted as a comma-joined employer annotation.
///
/// An absent or empty annotation is the empty set. Names are written in
/// sorted order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmployeeNameSet(BTreeSet<String>);

impl EmployeeNameSet {
    /// Decode an annotation value
    pub fn parse(value: Option<&str>) -> Self {
        value
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Encode as an annotation value
    pub fn to_annotation(&self) -> String {
        self.0.iter().cloned().collect::<Vec<_>>().join(",")
    }

    /// Whether `name` is in the set
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// Add a name
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        self.0.insert(name.into())
    }

    /// Remove a name
    pub fn remove(&mut self, name: &str) -> bool {
        self.0.remove(name)
    }

    /// Number of names
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no names are recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// Names in this set that are not in `other`, sorted
    pub fn difference(&self, other: &EmployeeNameSet) -> Vec<String> {
        self.0.difference(&other.0).cloned().collect()
    }

    /// Names in either set, sorted
    pub fn union(&self, other: &EmployeeNameSet) -> Vec<String> {
        self.0.union(&other.0).cloned().collect()
    }
}

impl FromIterator<String> for EmployeeNameSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a String> for EmployeeNameSet {
    fn from_iter<I: IntoIterator<Item = &'a String>>(iter: I) -> Self {
        Self(iter.into_iter().cloned().collect())
    }
}

impl fmt::Display for EmployeeNameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_annotation())
    }
}

/// Content of the pod availability conditions annotation.
///
/// Only `expectedFinalizers` is interpreted; any other fields are carried
/// through unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableConditions {
    /// Employer key to expected token
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expected_finalizers: BTreeMap<String, String>,

    /// Fields owned by other writers
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl AvailableConditions {
    /// Decode the annotation; absent or empty means no conditions
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(Self::default()),
            Some(v) if v.is_empty() => Ok(Self::default()),
            Some(v) => serde_json::from_str(v).map_err(|e| {
                Error::serialization_for_kind(POD_AVAILABLE_CONDITIONS_ANNOTATION, e.to_string())
            }),
        }
    }

    /// Encode as an annotation value
    pub fn to_annotation(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::serialization_for_kind(POD_AVAILABLE_CONDITIONS_ANNOTATION, e.to_string())
        })
    }

    /// Set `key` to `token`; returns false when it already had that value
    pub fn insert_expected(&mut self, key: &str, token: &str) -> bool {
        if self.expected_finalizers.get(key).map(String::as_str) == Some(token) {
            return false;
        }
        self.expected_finalizers
            .insert(key.to_string(), token.to_string());
        true
    }

    /// Remove `key`; returns false when it was not present
    pub fn remove_expected(&mut self, key: &str) -> bool {
        self.expected_finalizers.remove(key).is_some()
    }
}
