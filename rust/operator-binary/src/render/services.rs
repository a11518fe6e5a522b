use std::collections::BTreeMap;

use snafu::ensure;
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{Service, ServicePort, ServiceSpec},
        apimachinery::pkg::util::intstr::IntOrString,
    },
    kube::ResourceExt,
};

use super::{
    cluster_selector, naming, node_group_selector, object_meta, union, Result,
    UnknownTargetGroupSnafu, HTTP_PORT, TRANSPORT_PORT,
};
use crate::crd::{NodeGroupSpec, Opensearch};

const TOLERATE_UNREADY_ENDPOINTS_ANNOTATION: &str =
    "service.alpha.kubernetes.io/tolerate-unready-endpoints";

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

fn cluster_ports() -> Vec<ServicePort> {
    vec![port("http", HTTP_PORT), port("transport", TRANSPORT_PORT)]
}

fn service(
    cluster: &Opensearch,
    name: String,
    annotations: BTreeMap<String, String>,
    spec: ServiceSpec,
) -> Service {
    Service {
        metadata: object_meta(cluster, name, cluster.labels().clone(), annotations),
        spec: Some(ServiceSpec {
            session_affinity: Some("None".to_string()),
            ..spec
        }),
        ..Default::default()
    }
}

/// `{cluster}-os`, reaching every node of the cluster.
pub fn build_global_service(cluster: &Opensearch) -> Service {
    service(
        cluster,
        naming::global_service_name(cluster),
        cluster.annotations().clone(),
        ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(cluster_selector(cluster)),
            ports: Some(cluster_ports()),
            ..Default::default()
        },
    )
}

/// The regular and the headless service of a node group, in that order.
pub fn build_node_group_services(cluster: &Opensearch, group: &NodeGroupSpec) -> [Service; 2] {
    let selector = node_group_selector(cluster, &group.name);
    let regular = service(
        cluster,
        naming::node_group_service_name(cluster, &group.name),
        cluster.annotations().clone(),
        ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector.clone()),
            ports: Some(cluster_ports()),
            ..Default::default()
        },
    );
    let headless_annotations = BTreeMap::from([(
        TOLERATE_UNREADY_ENDPOINTS_ANNOTATION.to_string(),
        "true".to_string(),
    )]);
    let headless = service(
        cluster,
        naming::headless_service_name(cluster, &group.name),
        union([cluster.annotations(), &headless_annotations]),
        ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector),
            ports: Some(cluster_ports()),
            ..Default::default()
        },
    );
    [regular, headless]
}

/// `None` unless the load balancer endpoint is enabled. Fails when it targets a node
/// group the cluster does not declare.
pub fn build_load_balancer(cluster: &Opensearch) -> Result<Option<Service>> {
    let Some(lb) = cluster.load_balancer() else {
        return Ok(None);
    };
    let selector = match lb
        .target_node_group_name
        .as_deref()
        .filter(|group| !group.is_empty())
    {
        Some(group) => {
            ensure!(
                cluster.node_group(group).is_some(),
                UnknownTargetGroupSnafu {
                    endpoint: "loadBalancer",
                    group,
                }
            );
            node_group_selector(cluster, group)
        }
        None => cluster_selector(cluster),
    };
    Ok(Some(service(
        cluster,
        naming::load_balancer_service_name(cluster),
        cluster.annotations().clone(),
        ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: Some(selector),
            ports: Some(vec![port("http", HTTP_PORT)]),
            ..Default::default()
        },
    )))
}
