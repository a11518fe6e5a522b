use std::collections::BTreeMap;

use snafu::{ensure, OptionExt};
use stackable_operator::{
    k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
    },
    kube::ResourceExt,
};

use super::{
    merge::merge_overlay, naming, object_meta, union, MissingIngressHostSnafu, Result,
    UnknownTargetGroupSnafu, HTTP_PORT,
};
use crate::crd::Opensearch;

fn default_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "nginx.ingress.kubernetes.io/force-ssl-redirect".to_string(),
            "true".to_string(),
        ),
        (
            "nginx.ingress.kubernetes.io/backend-protocol".to_string(),
            "HTTPS".to_string(),
        ),
    ])
}

/// `None` unless the ingress endpoint is enabled.
///
/// The rendered rule routes `/` of the declared host to the cluster service, or to the
/// target node group service. A user supplied ingress spec is merged on top, where only
/// its non-empty fields replace rendered ones.
pub fn build_ingress(cluster: &Opensearch) -> Result<Option<Ingress>> {
    let Some(endpoint) = cluster.ingress() else {
        return Ok(None);
    };
    let host = endpoint
        .host
        .as_deref()
        .filter(|host| !host.is_empty())
        .context(MissingIngressHostSnafu)?;

    let target_service = match endpoint
        .target_node_group_name
        .as_deref()
        .filter(|group| !group.is_empty())
    {
        Some(group) => {
            ensure!(
                cluster.node_group(group).is_some(),
                UnknownTargetGroupSnafu {
                    endpoint: "ingress",
                    group,
                }
            );
            naming::node_group_service_name(cluster, group)
        }
        None => naming::global_service_name(cluster),
    };

    let rendered_spec = IngressSpec {
        rules: Some(vec![IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: target_service,
                            port: Some(ServiceBackendPort {
                                number: Some(HTTP_PORT),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        }]),
        tls: Some(vec![IngressTLS {
            hosts: Some(vec![host.to_string()]),
            secret_name: endpoint.secret_ref.clone(),
        }]),
        ..Default::default()
    };
    let spec = match &endpoint.ingress_spec {
        Some(overlay) => merge_overlay(rendered_spec, overlay, "ingress spec")?,
        None => rendered_spec,
    };

    Ok(Some(Ingress {
        metadata: object_meta(
            cluster,
            naming::ingress_name(cluster),
            union([cluster.labels(), &endpoint.labels]),
            union([
                &default_annotations(),
                cluster.annotations(),
                &endpoint.annotations,
            ]),
        ),
        spec: Some(spec),
        ..Default::default()
    }))
}
