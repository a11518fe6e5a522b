use stackable_operator::k8s_openapi::{
    api::core::v1::{Affinity, PodAffinityTerm, PodAntiAffinity, WeightedPodAffinityTerm},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};

use super::node_group_selector;
use crate::crd::{AntiAffinitySpec, NodeGroupSpec, Opensearch};

pub const DEFAULT_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
const HARD_ANTI_AFFINITY: &str = "hard";
const PREFERRED_WEIGHT: i32 = 10;

/// Field-wise merge, the node group wins over the global defaults.
pub fn effective_anti_affinity(
    global: Option<&AntiAffinitySpec>,
    group: Option<&AntiAffinitySpec>,
) -> AntiAffinitySpec {
    let pick = |field: fn(&AntiAffinitySpec) -> Option<&String>| {
        group
            .and_then(field)
            .or_else(|| global.and_then(field))
            .filter(|value| !value.is_empty())
            .cloned()
    };
    AntiAffinitySpec {
        type_: pick(|spec| spec.type_.as_ref()),
        topology_key: pick(|spec| spec.topology_key.as_ref()),
    }
}

/// Spreads the pods of a node group. `hard` gives a required term, anything else a
/// preferred one.
pub fn build_affinity(cluster: &Opensearch, group: &NodeGroupSpec) -> Affinity {
    let spec = effective_anti_affinity(
        cluster.spec.global_node_group.anti_affinity.as_ref(),
        group.anti_affinity.as_ref(),
    );
    let term = PodAffinityTerm {
        topology_key: spec
            .topology_key
            .unwrap_or_else(|| DEFAULT_TOPOLOGY_KEY.to_string()),
        label_selector: Some(LabelSelector {
            match_labels: Some(node_group_selector(cluster, &group.name)),
            ..Default::default()
        }),
        ..Default::default()
    };
    let anti_affinity = if spec.type_.as_deref() == Some(HARD_ANTI_AFFINITY) {
        PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![term]),
            ..Default::default()
        }
    } else {
        PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: PREFERRED_WEIGHT,
                    pod_affinity_term: term,
                },
            ]),
            ..Default::default()
        }
    };
    Affinity {
        pod_anti_affinity: Some(anti_affinity),
        ..Default::default()
    }
}
