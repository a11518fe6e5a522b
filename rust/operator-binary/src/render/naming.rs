//! Names of every object derived from a cluster.

use stackable_operator::kube::ResourceExt;

use crate::crd::{NodeGroupSpec, Opensearch};

/// `{cluster}-{group}-os`, shared by the workload, the group service and the PDB.
pub fn node_group_name(cluster: &Opensearch, group: &str) -> String {
    format!("{}-{group}-os", cluster.name_any())
}

pub fn node_group_service_name(cluster: &Opensearch, group: &str) -> String {
    node_group_name(cluster, group)
}

pub fn headless_service_name(cluster: &Opensearch, group: &str) -> String {
    format!("{}-headless", node_group_name(cluster, group))
}

pub fn config_map_name(cluster: &Opensearch, group: &str) -> String {
    format!("{}-config", node_group_name(cluster, group))
}

pub fn pdb_name(cluster: &Opensearch, group: &str) -> String {
    node_group_name(cluster, group)
}

pub fn global_service_name(cluster: &Opensearch) -> String {
    format!("{}-os", cluster.name_any())
}

pub fn load_balancer_service_name(cluster: &Opensearch) -> String {
    format!("{}-lb", global_service_name(cluster))
}

pub fn ingress_name(cluster: &Opensearch) -> String {
    cluster.name_any()
}

pub fn transport_secret_name(cluster: &Opensearch) -> String {
    format!("opensearch-{}-transport-tls", cluster.name_any())
}

/// The operator managed API secret, unless the load balancer points at a user secret.
pub fn api_secret_name(cluster: &Opensearch) -> String {
    match cluster.external_api_secret() {
        Some(name) => name.to_string(),
        None => format!("{}-os-tls-api", cluster.name_any()),
    }
}

pub fn credentials_secret_name(cluster: &Opensearch) -> String {
    format!("{}-os-credential", cluster.name_any())
}

/// Pod names of a node group, which double as transport certificate subjects.
pub fn node_identities(cluster: &Opensearch, group: &NodeGroupSpec) -> Vec<String> {
    let base = node_group_name(cluster, &group.name);
    (0..group.replicas)
        .map(|ordinal| format!("{base}-{ordinal}"))
        .collect()
}

/// Every node identity of the cluster, in node group declaration order.
pub fn all_node_identities(cluster: &Opensearch) -> Vec<String> {
    cluster
        .spec
        .node_groups
        .iter()
        .flat_map(|group| node_identities(cluster, group))
        .collect()
}
