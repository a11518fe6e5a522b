//! Environment of the OpenSearch container: roles, discovery and fixed settings.

use stackable_operator::{
    k8s_openapi::api::core::v1::{EnvFromSource, EnvVar, EnvVarSource, ObjectFieldSelector},
    kube::ResourceExt,
};

use super::naming;
use crate::{
    crd::{NodeGroupSpec, NodeRole, Opensearch},
    utils::join_non_empty,
};

/// One `node.{role}` variable per role of the vocabulary. Missing roles are rendered
/// as an explicit `false`.
pub fn role_env(group: &NodeGroupSpec) -> Vec<EnvVar> {
    NodeRole::vocabulary()
        .map(|role| env_var(format!("node.{role}"), group.has_role(role).to_string()))
        .collect()
}

fn cluster_manager_groups(cluster: &Opensearch) -> impl Iterator<Item = &NodeGroupSpec> {
    cluster
        .spec
        .node_groups
        .iter()
        .filter(|group| group.has_role(NodeRole::ClusterManager))
}

/// Node identities of every cluster manager group, in declaration order.
pub fn initial_master_nodes(cluster: &Opensearch) -> String {
    cluster_manager_groups(cluster)
        .flat_map(|group| naming::node_identities(cluster, group))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn discovery_seed_hosts(cluster: &Opensearch) -> String {
    cluster_manager_groups(cluster)
        .map(|group| naming::headless_service_name(cluster, &group.name))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A cluster made of exactly one node bootstraps without discovery.
pub fn is_single_node(cluster: &Opensearch) -> bool {
    matches!(cluster.spec.node_groups.as_slice(), [group] if group.replicas == 1)
}

pub fn java_opts(cluster: &Opensearch, group: &NodeGroupSpec) -> String {
    join_non_empty([
        cluster.spec.global_node_group.jvm.as_deref().unwrap_or_default(),
        group.jvm.as_deref().unwrap_or_default(),
    ])
}

/// Full container environment. Entries are merged by name: global user variables,
/// then group user variables, then roles and finally the settings the operator
/// depends on.
pub fn container_env(cluster: &Opensearch, group: &NodeGroupSpec) -> Vec<EnvVar> {
    let mut env = Vec::new();
    merge_env(&mut env, cluster.spec.global_node_group.env.iter().cloned());
    merge_env(&mut env, group.env.iter().cloned());
    merge_env(&mut env, role_env(group));

    let mut fixed = vec![
        field_ref_env("node.name", "metadata.name"),
        field_ref_env("host", "spec.nodeName"),
        env_var("OPENSEARCH_JAVA_OPTS", java_opts(cluster, group)),
    ];
    if is_single_node(cluster) {
        fixed.push(env_var("discovery.type", "single-node"));
    } else {
        fixed.push(env_var(
            "cluster.initial_master_nodes",
            initial_master_nodes(cluster),
        ));
        fixed.push(env_var("discovery.seed_hosts", discovery_seed_hosts(cluster)));
    }
    fixed.extend([
        env_var("cluster.name", cluster.name_any()),
        env_var("network.host", "0.0.0.0"),
        env_var("bootstrap.memory_lock", "true"),
        env_var("DISABLE_INSTALL_DEMO_CONFIG", "true"),
    ]);
    merge_env(&mut env, fixed);
    env
}

/// Group sources first, then the global ones. Duplicates are kept.
pub fn container_env_from(cluster: &Opensearch, group: &NodeGroupSpec) -> Vec<EnvFromSource> {
    group
        .env_from
        .iter()
        .chain(&cluster.spec.global_node_group.env_from)
        .cloned()
        .collect()
}

fn merge_env(env: &mut Vec<EnvVar>, extra: impl IntoIterator<Item = EnvVar>) {
    for var in extra {
        match env.iter_mut().find(|existing| existing.name == var.name) {
            Some(existing) => *existing = var,
            None => env.push(var),
        }
    }
}

fn env_var(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::test_support::cluster_from_yaml;

    fn value<'a>(env: &'a [EnvVar], name: &str) -> Option<&'a str> {
        env.iter()
            .find(|var| var.name == name)
            .and_then(|var| var.value.as_deref())
    }

    #[test]
    fn master_discovery_strings() {
        let cluster = cluster_from_yaml(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec:
              nodeGroups:
                - name: all
                  replicas: 3
                  roles: [cluster_manager, data, ingest]
                - name: data
                  replicas: 2
                  roles: [data]
                - name: master
                  replicas: 3
                  roles: [cluster_manager]
            "#,
        );
        assert_eq!(
            initial_master_nodes(&cluster),
            "test-all-os-0 test-all-os-1 test-all-os-2 test-master-os-0 test-master-os-1 test-master-os-2"
        );
        assert_eq!(
            discovery_seed_hosts(&cluster),
            "test-all-os-headless test-master-os-headless"
        );
        assert!(!is_single_node(&cluster));
    }

    #[test]
    fn role_env_covers_vocabulary_in_order() {
        let group = NodeGroupSpec {
            name: "master".to_string(),
            replicas: 1,
            roles: vec![NodeRole::ClusterManager],
            ..Default::default()
        };
        let rendered: Vec<(String, String)> = role_env(&group)
            .into_iter()
            .map(|var| (var.name, var.value.unwrap()))
            .collect();
        assert_eq!(
            rendered,
            [
                ("node.cluster_manager", "true"),
                ("node.data", "false"),
                ("node.ingest", "false"),
                ("node.ml", "false"),
                ("node.remote_cluster_client", "false"),
                ("node.transform", "false"),
            ]
            .map(|(name, value)| (name.to_string(), value.to_string()))
        );
    }

    #[test]
    fn single_node_skips_discovery() {
        let cluster = cluster_from_yaml(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec:
              nodeGroups:
                - name: all
                  replicas: 1
                  roles: [cluster_manager, data]
            "#,
        );
        let env = container_env(&cluster, &cluster.spec.node_groups[0]);
        assert_eq!(value(&env, "discovery.type"), Some("single-node"));
        assert_eq!(value(&env, "cluster.initial_master_nodes"), None);
        assert_eq!(value(&env, "discovery.seed_hosts"), None);
        assert_eq!(value(&env, "cluster.name"), Some("test"));
    }

    #[test]
    fn user_env_is_merged_by_name_and_fixed_env_wins() {
        let cluster = cluster_from_yaml(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec:
              globalNodeGroup:
                jvm: -Xms1g
                env:
                  - name: A
                    value: global
                  - name: network.host
                    value: 127.0.0.1
                envFrom:
                  - configMapRef:
                      name: global-env
              nodeGroups:
                - name: master
                  replicas: 3
                  roles: [cluster_manager]
                  jvm: -Xmx1g
                  env:
                    - name: A
                      value: group
                    - name: B
                      value: group
                  envFrom:
                    - secretRef:
                        name: group-env
            "#,
        );
        let group = &cluster.spec.node_groups[0];
        let env = container_env(&cluster, group);
        assert_eq!(value(&env, "A"), Some("group"));
        assert_eq!(value(&env, "B"), Some("group"));
        assert_eq!(value(&env, "network.host"), Some("0.0.0.0"));
        assert_eq!(value(&env, "OPENSEARCH_JAVA_OPTS"), Some("-Xms1g -Xmx1g"));
        assert_eq!(env.iter().filter(|var| var.name == "A").count(), 1);

        let node_name = env.iter().find(|var| var.name == "node.name").unwrap();
        let field_ref = node_name
            .value_from
            .as_ref()
            .and_then(|source| source.field_ref.as_ref())
            .unwrap();
        assert_eq!(field_ref.field_path, "metadata.name");

        let env_from = container_env_from(&cluster, group);
        assert_eq!(env_from.len(), 2);
        assert!(env_from[0].secret_ref.is_some());
        assert!(env_from[1].config_map_ref.is_some());
    }
}
