//! Pure rendering of the objects derived from an [`Opensearch`] cluster.
//!
//! Nothing in here talks to the API server. The same cluster always renders to the same
//! objects, and a validation failure means that nothing is rendered at all.

use std::collections::{BTreeMap, BTreeSet};

use snafu::{ensure, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::StatefulSet,
            core::v1::{ConfigMap, Service},
            networking::v1::Ingress,
            policy::v1::PodDisruptionBudget,
        },
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    },
    kube::{Resource, ResourceExt},
};

use crate::crd::Opensearch;

pub mod affinity;
pub mod config;
pub mod env;
pub mod ingress;
pub mod merge;
pub mod naming;
pub mod pdb;
pub mod services;
pub mod statefulset;

pub const CLUSTER_LABEL: &str = "cluster";
pub const NODE_GROUP_LABEL: &str = "nodeGroup";

pub const HTTP_PORT: i32 = 9200;
pub const TRANSPORT_PORT: i32 = 9300;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("node group {name:?} is declared more than once"))]
    DuplicateNodeGroup { name: String },

    #[snafu(display("{endpoint} targets node group {group:?}, which does not exist"))]
    UnknownTargetGroup {
        endpoint: &'static str,
        group: String,
    },

    #[snafu(display("endpoint.ingress.host must be provided when the ingress is enabled"))]
    MissingIngressHost,

    #[snafu(display("failed to merge config file {file:?} of node group {group:?}"))]
    ParseConfig {
        source: serde_yaml::Error,
        group: String,
        file: String,
    },

    #[snafu(display("failed to merge the user provided {what}"))]
    MergeOverlay {
        source: serde_json::Error,
        what: &'static str,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything the controller applies for one cluster.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DerivedObjects {
    pub stateful_sets: Vec<StatefulSet>,
    pub services: Vec<Service>,
    pub load_balancer: Option<Service>,
    pub config_maps: Vec<ConfigMap>,
    pub pod_disruption_budgets: Vec<PodDisruptionBudget>,
    pub ingress: Option<Ingress>,
}

/// Renders every derived object of the cluster. Group names and endpoints are validated
/// first, so a duplicate group or a dangling target group fails the whole render.
pub fn render_cluster(cluster: &Opensearch) -> Result<DerivedObjects> {
    let mut group_names = BTreeSet::new();
    for group in &cluster.spec.node_groups {
        ensure!(
            group_names.insert(group.name.as_str()),
            DuplicateNodeGroupSnafu { name: &group.name }
        );
    }
    let ingress = ingress::build_ingress(cluster)?;
    let load_balancer = services::build_load_balancer(cluster)?;

    let mut objects = DerivedObjects {
        services: vec![services::build_global_service(cluster)],
        load_balancer,
        ingress,
        ..Default::default()
    };
    for group in &cluster.spec.node_groups {
        let config_files = config::node_group_config(cluster, group)?;
        objects.stateful_sets.push(statefulset::build_stateful_set(
            cluster,
            group,
            &config_files,
        )?);
        objects
            .config_maps
            .push(config::build_config_map(cluster, group, config_files));
        objects
            .services
            .extend(services::build_node_group_services(cluster, group));
        objects
            .pod_disruption_budgets
            .push(pdb::build_pod_disruption_budget(cluster, group)?);
    }
    Ok(objects)
}

pub fn cluster_selector(cluster: &Opensearch) -> BTreeMap<String, String> {
    BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster.name_any())])
}

pub fn node_group_selector(cluster: &Opensearch, group: &str) -> BTreeMap<String, String> {
    let mut selector = cluster_selector(cluster);
    selector.insert(NODE_GROUP_LABEL.to_string(), group.to_string());
    selector
}

/// Metadata for an object owned by the cluster, living in the cluster's namespace.
pub(crate) fn object_meta(
    cluster: &Opensearch,
    name: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: non_empty(labels),
        annotations: non_empty(annotations),
        owner_references: cluster
            .controller_owner_ref(&())
            .map(|owner| vec![owner]),
        ..Default::default()
    }
}

pub(crate) fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    Some(map).filter(|map| !map.is_empty())
}

/// Later maps win on conflicting keys.
pub(crate) fn union<'a>(
    maps: impl IntoIterator<Item = &'a BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    maps.into_iter()
        .flat_map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::crd::Opensearch;

    /// Parses a cluster from YAML, filling in namespace and uid.
    pub fn cluster_from_yaml(input: &str) -> Opensearch {
        let deserializer = serde_yaml::Deserializer::from_str(input);
        let mut cluster: Opensearch =
            serde_yaml::with::singleton_map_recursive::deserialize(deserializer).unwrap();
        cluster
            .metadata
            .namespace
            .get_or_insert_with(|| "default".to_string());
        cluster
            .metadata
            .uid
            .get_or_insert_with(|| "c6a0a3b6-9f3b-4a1d-8f1a-000000000001".to_string());
        cluster
    }
}
