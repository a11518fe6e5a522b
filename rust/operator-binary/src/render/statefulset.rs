//! The StatefulSet of a node group.
//!
//! The pod template is rendered first. The global and then the node group pod templates
//! supplied by the user are merged on top of it, so users can add sidecars or override
//! single container fields without restating the whole pod.

use std::collections::BTreeMap;

use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::{StatefulSet, StatefulSetSpec},
            core::v1::{
                Capabilities, ConfigMapVolumeSource, Container, ContainerPort,
                PersistentVolumeClaim, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
                SecretVolumeSource, SecurityContext, TCPSocketAction, Volume, VolumeMount,
            },
        },
        apimachinery::pkg::{
            apis::meta::v1::{LabelSelector, ObjectMeta},
            util::intstr::IntOrString,
        },
    },
    kube::ResourceExt,
};

use super::{
    affinity::build_affinity, env, merge::merge_overlay, naming, node_group_selector,
    non_empty, object_meta, union, Result, HTTP_PORT, TRANSPORT_PORT,
};
use crate::crd::{NodeGroupSpec, Opensearch, PersistenceSpec};

pub const OPENSEARCH_CONTAINER_NAME: &str = "opensearch";
pub const SYSCTL_CONTAINER_NAME: &str = "configure-sysctl";

pub const NODE_TLS_VOLUME: &str = "node-tls";
pub const API_TLS_VOLUME: &str = "api-tls";
pub const CONFIG_VOLUME: &str = "opensearch-config";
pub const DATA_VOLUME: &str = "opensearch-data";
pub const SECURITY_VOLUME: &str = "opensearch-security";

const CONFIG_DIR: &str = "/usr/share/opensearch/config";
const DATA_DIR: &str = "/usr/share/opensearch/data";

const OPENSEARCH_UID: i64 = 1000;
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 120;

pub fn build_stateful_set(
    cluster: &Opensearch,
    group: &NodeGroupSpec,
    config_files: &BTreeMap<String, String>,
) -> Result<StatefulSet> {
    let global = &cluster.spec.global_node_group;
    let name = naming::node_group_name(cluster, &group.name);
    let selector = node_group_selector(cluster, &group.name);
    let persistence = group.persistence.as_ref().or(global.persistence.as_ref());

    let mut template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            name: Some(name.clone()),
            labels: Some(union([
                cluster.labels(),
                &global.labels,
                &group.labels,
                &selector,
            ])),
            annotations: non_empty(union([
                cluster.annotations(),
                &global.annotations,
                &group.annotations,
            ])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![opensearch_container(
                cluster,
                group,
                persistence,
                config_files,
            )],
            init_containers: cluster
                .set_vm_max_map_count()
                .then(|| vec![sysctl_container(cluster, group)]),
            volumes: Some(volumes(cluster, group, persistence)),
            affinity: Some(build_affinity(cluster, group)),
            tolerations: Some(group.tolerations.clone()).filter(|t| !t.is_empty()),
            node_selector: non_empty(group.node_selector.clone()),
            image_pull_secrets: Some(cluster.spec.image_pull_secrets.clone())
                .filter(|secrets| !secrets.is_empty()),
            termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
            security_context: Some(PodSecurityContext {
                fs_group: Some(OPENSEARCH_UID),
                ..Default::default()
            }),
            ..Default::default()
        }),
    };
    for overlay in [global.pod_template.as_ref(), group.pod_template.as_ref()]
        .into_iter()
        .flatten()
    {
        template = merge_overlay(template, overlay, "pod template")?;
    }
    // The selector must keep matching whatever the overlays did to the labels
    template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(selector.clone());

    Ok(StatefulSet {
        metadata: object_meta(
            cluster,
            name,
            cluster.labels().clone(),
            cluster.annotations().clone(),
        ),
        spec: Some(StatefulSetSpec {
            replicas: Some(i32::from(group.replicas)),
            pod_management_policy: Some("Parallel".to_string()),
            service_name: naming::headless_service_name(cluster, &group.name),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template,
            volume_claim_templates: persistence
                .and_then(|persistence| persistence.volume_claim_spec.clone())
                .map(|spec| {
                    vec![PersistentVolumeClaim {
                        metadata: ObjectMeta {
                            name: Some(DATA_VOLUME.to_string()),
                            ..Default::default()
                        },
                        spec: Some(spec),
                        ..Default::default()
                    }]
                }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Installs the declared plugins, then hands over to the stock entrypoint.
pub fn bootstrap_script(plugins: &[String]) -> String {
    let mut script = String::from("#!/usr/bin/env bash\nset -euo pipefail\n\n");
    for plugin in plugins {
        script.push_str(&format!("./bin/opensearch-plugin install -b {plugin}\n"));
    }
    script.push_str("bash opensearch-docker-entrypoint.sh");
    script
}

fn opensearch_container(
    cluster: &Opensearch,
    group: &NodeGroupSpec,
    persistence: Option<&PersistenceSpec>,
    config_files: &BTreeMap<String, String>,
) -> Container {
    Container {
        name: OPENSEARCH_CONTAINER_NAME.to_string(),
        image: Some(cluster.container_image()),
        image_pull_policy: cluster.spec.image_pull_policy.clone(),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            bootstrap_script(&cluster.spec.plugins_list),
        ]),
        env: Some(env::container_env(cluster, group)),
        env_from: Some(env::container_env_from(cluster, group)).filter(|e| !e.is_empty()),
        ports: Some(vec![
            container_port("http", HTTP_PORT),
            container_port("transport", TRANSPORT_PORT),
        ]),
        resources: group.resources.clone(),
        liveness_probe: Some(tcp_probe(TRANSPORT_PORT, 30, 10, None)),
        readiness_probe: Some(tcp_probe(HTTP_PORT, 30, 3, None)),
        startup_probe: Some(tcp_probe(HTTP_PORT, 10, 30, Some(10))),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            run_as_user: Some(OPENSEARCH_UID),
            run_as_non_root: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts(cluster, group, persistence, config_files)),
        ..Default::default()
    }
}

fn sysctl_container(cluster: &Opensearch, group: &NodeGroupSpec) -> Container {
    Container {
        name: SYSCTL_CONTAINER_NAME.to_string(),
        image: Some(cluster.container_image()),
        image_pull_policy: cluster.spec.image_pull_policy.clone(),
        command: Some(
            ["sysctl", "-w", "vm.max_map_count=262144"]
                .map(String::from)
                .to_vec(),
        ),
        resources: group
            .init_container_resources
            .as_ref()
            .or(cluster.spec.global_node_group.init_container_resources.as_ref())
            .cloned(),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            run_as_user: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn tcp_probe(
    port: i32,
    period_seconds: i32,
    failure_threshold: i32,
    initial_delay_seconds: Option<i32>,
) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds,
        timeout_seconds: Some(5),
        period_seconds: Some(period_seconds),
        failure_threshold: Some(failure_threshold),
        success_threshold: Some(1),
        ..Default::default()
    }
}

fn security_secret(cluster: &Opensearch, group: &NodeGroupSpec) -> Option<String> {
    group
        .security_ref
        .as_ref()
        .or(cluster.spec.global_node_group.security_ref.as_ref())
        .filter(|name| !name.is_empty())
        .cloned()
}

fn volume_mounts(
    cluster: &Opensearch,
    group: &NodeGroupSpec,
    persistence: Option<&PersistenceSpec>,
    config_files: &BTreeMap<String, String>,
) -> Vec<VolumeMount> {
    let mut mounts: Vec<VolumeMount> = cluster
        .spec
        .global_node_group
        .additional_volumes
        .iter()
        .map(|additional| VolumeMount {
            name: additional.volume.name.clone(),
            mount_path: additional.mount_path.clone(),
            read_only: additional.read_only,
            sub_path: additional.sub_path.clone(),
            ..Default::default()
        })
        .collect();
    mounts.push(mount(NODE_TLS_VOLUME, format!("{CONFIG_DIR}/certs/node")));
    mounts.push(mount(API_TLS_VOLUME, format!("{CONFIG_DIR}/certs/api")));
    if persistence.is_some_and(|p| p.volume_claim_spec.is_some() || p.volume.is_some()) {
        mounts.push(mount(DATA_VOLUME, DATA_DIR.to_string()));
    }
    mounts.extend(config_files.keys().map(|file| VolumeMount {
        name: CONFIG_VOLUME.to_string(),
        mount_path: format!("{CONFIG_DIR}/{file}"),
        sub_path: Some(file.clone()),
        ..Default::default()
    }));
    if security_secret(cluster, group).is_some() {
        mounts.push(mount(
            SECURITY_VOLUME,
            format!("{CONFIG_DIR}/opensearch-security"),
        ));
    }
    mounts
}

fn mount(name: &str, mount_path: String) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path,
        ..Default::default()
    }
}

fn volumes(
    cluster: &Opensearch,
    group: &NodeGroupSpec,
    persistence: Option<&PersistenceSpec>,
) -> Vec<Volume> {
    let mut volumes = vec![
        secret_volume(NODE_TLS_VOLUME, naming::transport_secret_name(cluster)),
        secret_volume(API_TLS_VOLUME, naming::api_secret_name(cluster)),
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: naming::config_map_name(cluster, &group.name),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    volumes.extend(
        cluster
            .spec
            .global_node_group
            .additional_volumes
            .iter()
            .map(|additional| additional.volume.clone()),
    );
    if let Some(secret) = security_secret(cluster, group) {
        volumes.push(secret_volume(SECURITY_VOLUME, secret));
    }
    if let Some(volume) = persistence
        .filter(|persistence| persistence.volume_claim_spec.is_none())
        .and_then(|persistence| persistence.volume.as_ref())
    {
        volumes.push(Volume {
            name: DATA_VOLUME.to_string(),
            ..volume.clone()
        });
    }
    volumes
}

fn secret_volume(name: &str, secret_name: String) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{config::node_group_config, test_support::cluster_from_yaml};

    fn render(yaml: &str) -> StatefulSet {
        let cluster = cluster_from_yaml(yaml);
        let group = &cluster.spec.node_groups[0];
        let files = node_group_config(&cluster, group).unwrap();
        build_stateful_set(&cluster, group, &files).unwrap()
    }

    fn pod_spec(sts: &StatefulSet) -> &PodSpec {
        sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    fn container<'a>(sts: &'a StatefulSet, name: &str) -> &'a Container {
        pod_spec(sts)
            .containers
            .iter()
            .find(|container| container.name == name)
            .unwrap()
    }

    const BASIC: &str = r#"
        apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
        kind: Opensearch
        metadata:
          name: test
          labels:
            env: prod
        spec:
          version: 2.3.0
          imagePullPolicy: IfNotPresent
          pluginsList:
            - repository-s3
            - analysis-icu
          nodeGroups:
            - name: master
              replicas: 3
              roles: [cluster_manager]
              labels:
                tier: control
    "#;

    #[test]
    fn workload_shape() {
        let sts = render(BASIC);
        assert_eq!(sts.metadata.name.as_deref(), Some("test-master-os"));
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));
        assert_eq!(spec.service_name, "test-master-os-headless");
        assert_eq!(
            spec.selector.match_labels,
            Some(BTreeMap::from([
                ("cluster".to_string(), "test".to_string()),
                ("nodeGroup".to_string(), "master".to_string()),
            ]))
        );
        let labels = spec.template.metadata.as_ref().unwrap().labels.clone().unwrap();
        assert_eq!(labels["env"], "prod");
        assert_eq!(labels["tier"], "control");
        assert_eq!(labels["nodeGroup"], "master");
        assert!(spec.volume_claim_templates.is_none());

        let pod = pod_spec(&sts);
        assert_eq!(pod.termination_grace_period_seconds, Some(120));
        assert_eq!(pod.security_context.as_ref().unwrap().fs_group, Some(1000));
    }

    #[test]
    fn opensearch_container() {
        let sts = render(BASIC);
        let opensearch = container(&sts, OPENSEARCH_CONTAINER_NAME);
        assert_eq!(
            opensearch.image.as_deref(),
            Some("public.ecr.aws/opensearchproject/opensearch:2.3.0")
        );
        assert_eq!(opensearch.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(
            opensearch.command.as_ref().unwrap()[2],
            "#!/usr/bin/env bash\nset -euo pipefail\n\n\
             ./bin/opensearch-plugin install -b repository-s3\n\
             ./bin/opensearch-plugin install -b analysis-icu\n\
             bash opensearch-docker-entrypoint.sh"
        );

        let liveness = opensearch.liveness_probe.as_ref().unwrap();
        assert_eq!(
            liveness.tcp_socket.as_ref().unwrap().port,
            IntOrString::Int(9300)
        );
        assert_eq!(liveness.failure_threshold, Some(10));
        let startup = opensearch.startup_probe.as_ref().unwrap();
        assert_eq!(startup.initial_delay_seconds, Some(10));
        assert_eq!(startup.failure_threshold, Some(30));
        assert_eq!(startup.period_seconds, Some(10));

        let security = opensearch.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_user, Some(1000));
        assert_eq!(security.run_as_non_root, Some(true));

        let mounts: Vec<(&str, &str)> = opensearch
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|mount| (mount.name.as_str(), mount.mount_path.as_str()))
            .collect();
        assert_eq!(
            mounts,
            vec![
                ("node-tls", "/usr/share/opensearch/config/certs/node"),
                ("api-tls", "/usr/share/opensearch/config/certs/api"),
                (
                    "opensearch-config",
                    "/usr/share/opensearch/config/opensearch.yml"
                ),
            ]
        );
    }

    #[test]
    fn volumes_and_sysctl() {
        let sts = render(BASIC);
        let pod = pod_spec(&sts);
        let volumes = pod.volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("opensearch-test-transport-tls")
        );
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("test-os-tls-api")
        );
        assert_eq!(
            volumes[2].config_map.as_ref().unwrap().name,
            "test-master-os-config"
        );

        let init = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, SYSCTL_CONTAINER_NAME);
        assert_eq!(
            init.security_context.as_ref().unwrap().privileged,
            Some(true)
        );

        let opted_out = render(&BASIC.replace("version: 2.3.0", "setVMMaxMapCount: false"));
        assert!(pod_spec(&opted_out).init_containers.is_none());
    }

    #[test]
    fn persistence_variants() {
        let claim = render(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec:
              globalNodeGroup:
                persistence:
                  volumeClaimSpec:
                    accessModes: [ReadWriteOnce]
                    resources:
                      requests:
                        storage: 5Gi
              nodeGroups:
                - name: data
                  replicas: 2
            "#,
        );
        let templates = claim
            .spec
            .as_ref()
            .unwrap()
            .volume_claim_templates
            .clone()
            .unwrap();
        assert_eq!(templates[0].metadata.name.as_deref(), Some(DATA_VOLUME));
        assert!(container(&claim, OPENSEARCH_CONTAINER_NAME)
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|mount| mount.name == DATA_VOLUME && mount.mount_path == DATA_DIR));

        let inline = render(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec:
              nodeGroups:
                - name: data
                  replicas: 2
                  persistence:
                    volume:
                      name: ignored
                      hostPath:
                        path: /data/opensearch
            "#,
        );
        assert!(inline
            .spec
            .as_ref()
            .unwrap()
            .volume_claim_templates
            .is_none());
        let data = pod_spec(&inline)
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|volume| volume.name == DATA_VOLUME)
            .unwrap();
        assert_eq!(
            data.host_path.as_ref().unwrap().path,
            "/data/opensearch"
        );
    }

    #[test]
    fn security_config_and_additional_volumes() {
        let sts = render(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec:
              globalNodeGroup:
                securityRef: global-security
                additionalVolumes:
                  - name: snapshot
                    mountPath: /mnt/snapshot
                    readOnly: true
                    persistentVolumeClaim:
                      claimName: snapshot
              nodeGroups:
                - name: master
                  replicas: 1
                  securityRef: group-security
            "#,
        );
        let volumes = pod_spec(&sts).volumes.as_ref().unwrap();
        let security = volumes
            .iter()
            .find(|volume| volume.name == SECURITY_VOLUME)
            .unwrap();
        assert_eq!(
            security.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("group-security")
        );
        assert!(volumes
            .iter()
            .any(|volume| volume.name == "snapshot" && volume.persistent_volume_claim.is_some()));

        let mounts = container(&sts, OPENSEARCH_CONTAINER_NAME)
            .volume_mounts
            .as_ref()
            .unwrap();
        assert_eq!(mounts[0].name, "snapshot");
        assert_eq!(mounts[0].read_only, Some(true));
        assert!(mounts.iter().any(|mount| mount.name == SECURITY_VOLUME));
    }

    #[test]
    fn user_pod_templates_are_merged_last() {
        let sts = render(
            r#"
            apiVersion: opensearch.k8s.webcenter.fr/v1alpha1
            kind: Opensearch
            metadata:
              name: test
            spec:
              globalNodeGroup:
                podTemplate:
                  spec:
                    priorityClassName: search
                    containers:
                      - name: opensearch
                        env:
                          - name: network.host
                            value: 10.0.0.1
              nodeGroups:
                - name: master
                  replicas: 3
                  roles: [cluster_manager]
                  podTemplate:
                    metadata:
                      labels:
                        nodeGroup: overridden
                    spec:
                      containers:
                        - name: exporter
                          image: exporter:latest
                        - name: opensearch
                          image: custom:1.0
            "#,
        );
        let pod = pod_spec(&sts);
        assert_eq!(pod.priority_class_name.as_deref(), Some("search"));
        assert_eq!(pod.containers.len(), 2);

        let opensearch = container(&sts, OPENSEARCH_CONTAINER_NAME);
        assert_eq!(opensearch.image.as_deref(), Some("custom:1.0"));
        // Rendered fields survive the overlay
        assert!(opensearch.startup_probe.is_some());
        let network_host = opensearch
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|var| var.name == "network.host")
            .unwrap();
        assert_eq!(network_host.value.as_deref(), Some("10.0.0.1"));

        let labels = sts.spec.as_ref().unwrap().template.metadata.as_ref().unwrap().labels.clone().unwrap();
        assert_eq!(labels["nodeGroup"], "master");
    }
}
