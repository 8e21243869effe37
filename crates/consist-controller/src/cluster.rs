//! Multi-cluster routing.
//!
//! Employers always live on the hub cluster (the federated control plane
//! when multi-cluster routing is on). Employees are either on the hub as
//! well, or, with local routing, on a member cluster named in the employee
//! name itself: `pod-name#cluster-name`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::Client;

use consist_common::{Error, Result};

/// Separator between pod name and cluster name in local-routed employee names
pub const CLUSTER_SEPARATOR: char = '#';

/// Where an object is read and written
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClusterRoute {
    /// The cluster the controller watches employers on
    Hub,
    /// A member cluster, by name
    Member(String),
}

impl fmt::Display for ClusterRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRoute::Hub => f.write_str("hub"),
            ClusterRoute::Member(name) => f.write_str(name),
        }
    }
}

/// How employee names map to clusters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmployeeRouting {
    /// No multi-cluster support; everything is on one cluster
    #[default]
    SingleCluster,
    /// Multi-cluster, employees addressed through the federated hub
    Federated,
    /// Multi-cluster, employees addressed on the member cluster in their name
    Local,
}

impl EmployeeRouting {
    /// True for either multi-cluster mode
    pub fn is_multi_cluster(&self) -> bool {
        !matches!(self, EmployeeRouting::SingleCluster)
    }

    /// Resolve a raw employee name to the object name and cluster holding it
    pub fn resolve(&self, raw_name: &str) -> Result<EmployeeAddress> {
        match self {
            EmployeeRouting::SingleCluster | EmployeeRouting::Federated => Ok(EmployeeAddress {
                name: raw_name.to_string(),
                route: ClusterRoute::Hub,
            }),
            EmployeeRouting::Local => {
                let mut parts = raw_name.split(CLUSTER_SEPARATOR);
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(name), Some(cluster), None) => Ok(EmployeeAddress {
                        name: name.to_string(),
                        route: ClusterRoute::Member(cluster.to_string()),
                    }),
                    _ => Err(Error::invalid_employee_name(raw_name)),
                }
            }
        }
    }
}

impl FromStr for EmployeeRouting {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single" | "single-cluster" => Ok(EmployeeRouting::SingleCluster),
            "fed" | "federated" => Ok(EmployeeRouting::Federated),
            "local" => Ok(EmployeeRouting::Local),
            other => Err(format!(
                "unknown employee routing '{other}', expected single, federated or local"
            )),
        }
    }
}

/// An employee object's name and cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmployeeAddress {
    /// Object name on its cluster
    pub name: String,
    /// Cluster holding the object
    pub route: ClusterRoute,
}

/// Kubernetes clients per cluster
#[derive(Clone)]
pub struct ClusterClients {
    hub: Client,
    members: BTreeMap<String, Client>,
}

impl ClusterClients {
    /// Clients for a single cluster
    pub fn single(hub: Client) -> Self {
        Self {
            hub,
            members: BTreeMap::new(),
        }
    }

    /// Add a member cluster client
    pub fn with_member(mut self, name: impl Into<String>, client: Client) -> Self {
        self.members.insert(name.into(), client);
        self
    }

    /// The hub client
    pub fn hub(&self) -> &Client {
        &self.hub
    }

    /// Names of configured member clusters
    pub fn member_names(&self) -> impl Iterator<Item = &String> {
        self.members.keys()
    }

    /// Client for the given route
    pub fn client_for(&self, route: &ClusterRoute) -> Result<Client> {
        match route {
            ClusterRoute::Hub => Ok(self.hub.clone()),
            ClusterRoute::Member(name) => self
                .members
                .get(name)
                .cloned()
                .ok_or_else(|| Error::unknown_cluster(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_and_federated_routes_use_hub_with_raw_name() {
        for routing in [EmployeeRouting::SingleCluster, EmployeeRouting::Federated] {
            let address = routing.resolve("p1#clusterA").expect("resolve");
            assert_eq!(address.name, "p1#clusterA");
            assert_eq!(address.route, ClusterRoute::Hub);
        }
    }

    /// Story: a local-routed employee is addressed on its own cluster, never the hub
    #[test]
    fn story_local_route_targets_member_cluster() {
        let address = EmployeeRouting::Local.resolve("p1#clusterA").expect("resolve");
        assert_eq!(address.name, "p1");
        assert_eq!(address.route, ClusterRoute::Member("clusterA".to_string()));
    }

    #[test]
    fn local_route_rejects_names_without_exactly_one_separator() {
        for bad in ["p1", "p1#a#b", ""] {
            let err = EmployeeRouting::Local.resolve(bad).expect_err("should fail");
            assert!(matches!(err, Error::InvalidEmployeeName { .. }));
        }
    }

    #[test]
    fn routing_parses_from_cli_names() {
        assert_eq!("local".parse(), Ok(EmployeeRouting::Local));
        assert_eq!("federated".parse(), Ok(EmployeeRouting::Federated));
        assert_eq!("single".parse(), Ok(EmployeeRouting::SingleCluster));
        assert!("mesh".parse::<EmployeeRouting>().is_err());
    }

    #[test]
    fn multi_cluster_flag() {
        assert!(!EmployeeRouting::SingleCluster.is_multi_cluster());
        assert!(EmployeeRouting::Federated.is_multi_cluster());
        assert!(EmployeeRouting::Local.is_multi_cluster());
    }

    #[test]
    fn route_display() {
        assert_eq!(ClusterRoute::Hub.to_string(), "hub");
        assert_eq!(ClusterRoute::Member("east".into()).to_string(), "east");
    }
}
