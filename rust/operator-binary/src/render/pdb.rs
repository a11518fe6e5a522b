use stackable_operator::{
    k8s_openapi::{
        api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec},
        apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
    },
    kube::ResourceExt,
};

use super::{merge::merge_overlay, naming, node_group_selector, object_meta, Result};
use crate::crd::{NodeGroupSpec, Opensearch};

/// Merges the global and group budgets, the group winning. A layer that sets only one of
/// `minAvailable` and `maxUnavailable` drops the other bound of the layers below it.
/// Without any bound the budget allows one unavailable pod.
pub fn build_pod_disruption_budget(
    cluster: &Opensearch,
    group: &NodeGroupSpec,
) -> Result<PodDisruptionBudget> {
    let mut spec = PodDisruptionBudgetSpec::default();
    for overlay in [
        cluster.spec.global_node_group.pod_disruption_budget.as_ref(),
        group.pod_disruption_budget.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        spec = merge_overlay(spec, overlay, "pod disruption budget")?;
        match (&overlay.min_available, &overlay.max_unavailable) {
            (Some(_), None) => spec.max_unavailable = None,
            (None, Some(_)) => spec.min_available = None,
            _ => {}
        }
    }
    spec.selector = Some(LabelSelector {
        match_labels: Some(node_group_selector(cluster, &group.name)),
        ..Default::default()
    });
    if spec.min_available.is_none() && spec.max_unavailable.is_none() {
        spec.max_unavailable = Some(IntOrString::Int(1));
    }

    Ok(PodDisruptionBudget {
        metadata: object_meta(
            cluster,
            naming::pdb_name(cluster, &group.name),
            cluster.labels().clone(),
            cluster.annotations().clone(),
        ),
        spec: Some(spec),
        ..Default::default()
    })
}
