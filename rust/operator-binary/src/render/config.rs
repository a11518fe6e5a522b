//! Per node group configuration files.
//!
//! Layers are applied in order: the injected security settings, the global defaults
//! and finally the node group overrides. A file present in a single layer is passed
//! through untouched. A file present in several layers is parsed as YAML, dotted keys
//! are expanded into nested maps and the layers are deep merged with later layers
//! winning on leaf keys.

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Value};
use snafu::ResultExt;
use stackable_operator::{k8s_openapi::api::core::v1::ConfigMap, kube::ResourceExt};

use super::{naming, object_meta, ParseConfigSnafu, Result};
use crate::crd::{NodeGroupSpec, Opensearch};

pub const OPENSEARCH_CONFIG_FILE: &str = "opensearch.yml";

// The truststore path really reads `${hostanme}`, existing clusters depend on it.
const INJECTED_OPENSEARCH_CONFIG: &str = "
plugins.security.ssl.transport.keystore_type: 'PKCS12/PFX'
plugins.security.ssl.transport.keystore_filepath: 'certs/transport/${hostname}.pfx'
plugins.security.ssl.transport.truststore_type: 'PKCS12/PFX'
plugins.security.ssl.transport.truststore_filepath: 'certs/transport/${hostanme}.pfx'
plugins.security.ssl.transport.enforce_hostname_verification: true
plugins.security.ssl.http.enabled: true
plugins.security.ssl.http.keystore_type: 'PKCS12/PFX'
plugins.security.ssl.http.keystore_filepath: 'certs/http/api.pfx'
plugins.security.ssl.http.truststore_type: 'PKCS12/PFX'
plugins.security.ssl.http.truststore_filepath: 'certs/http/api.pfx'";

/// The merged configuration files of a node group, keyed by file name.
pub fn node_group_config(
    cluster: &Opensearch,
    group: &NodeGroupSpec,
) -> Result<BTreeMap<String, String>> {
    let injected = BTreeMap::from([(
        OPENSEARCH_CONFIG_FILE.to_string(),
        INJECTED_OPENSEARCH_CONFIG.to_string(),
    )]);
    merge_config_layers(
        &group.name,
        [&injected, &cluster.spec.global_node_group.config, &group.config],
    )
}

pub fn build_config_map(
    cluster: &Opensearch,
    group: &NodeGroupSpec,
    files: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(
            cluster,
            naming::config_map_name(cluster, &group.name),
            cluster.labels().clone(),
            cluster.annotations().clone(),
        ),
        data: Some(files),
        ..Default::default()
    }
}

fn merge_config_layers<'a>(
    group: &str,
    layers: impl IntoIterator<Item = &'a BTreeMap<String, String>>,
) -> Result<BTreeMap<String, String>> {
    let mut contents_by_file: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for layer in layers {
        for (file, contents) in layer {
            contents_by_file
                .entry(file.as_str())
                .or_default()
                .push(contents.as_str());
        }
    }

    let mut merged = BTreeMap::new();
    for (file, contents) in contents_by_file {
        let rendered = match contents.as_slice() {
            [single] => single.to_string(),
            layers => {
                let mut document = Value::Mapping(Mapping::new());
                for layer in layers {
                    let parsed: Value =
                        serde_yaml::from_str(layer).context(ParseConfigSnafu { group, file })?;
                    merge_yaml(&mut document, expand_dotted_keys(parsed));
                }
                serde_yaml::to_string(&sort_keys(document))
                    .context(ParseConfigSnafu { group, file })?
            }
        };
        merged.insert(file.to_string(), rendered);
    }
    Ok(merged)
}

/// Turns `a.b.c: 1` into `a: {b: {c: 1}}`, recursively.
fn expand_dotted_keys(value: Value) -> Value {
    match value {
        Value::Mapping(mapping) => {
            let mut expanded = Value::Mapping(Mapping::new());
            for (key, value) in mapping {
                let value = expand_dotted_keys(value);
                let nested = match key.as_str() {
                    Some(path) if path.contains('.') => {
                        path.rsplit('.').fold(value, |inner, segment| {
                            let mut wrapper = Mapping::new();
                            wrapper.insert(Value::String(segment.to_string()), inner);
                            Value::Mapping(wrapper)
                        })
                    }
                    _ => {
                        let mut wrapper = Mapping::new();
                        wrapper.insert(key, value);
                        Value::Mapping(wrapper)
                    }
                };
                merge_yaml(&mut expanded, nested);
            }
            expanded
        }
        Value::Sequence(items) => {
            Value::Sequence(items.into_iter().map(expand_dotted_keys).collect())
        }
        other => other,
    }
}

fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Mapping(mapping) => {
            let mut entries: Vec<(Value, Value)> = mapping
                .into_iter()
                .map(|(key, value)| (key, sort_keys(value)))
                .collect();
            entries.sort_by_cached_key(|(key, _)| sort_key(key));
            Value::Mapping(entries.into_iter().collect())
        }
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

fn sort_key(key: &Value) -> String {
    match key {
        Value::String(key) => key.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crd::OpensearchSpec, render::Error};

    fn cluster(global: &[(&str, &str)], group: &[(&str, &str)]) -> Opensearch {
        let to_map = |entries: &[(&str, &str)]| {
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        let mut spec = OpensearchSpec::default();
        spec.global_node_group.config = to_map(global);
        spec.node_groups = vec![NodeGroupSpec {
            name: "master".to_string(),
            replicas: 1,
            config: to_map(group),
            ..Default::default()
        }];
        Opensearch::new("test", spec)
    }

    fn parse(contents: &str) -> Value {
        serde_yaml::from_str(contents).unwrap()
    }

    #[test]
    fn injected_config_is_kept_raw_without_overrides() {
        let cluster = cluster(&[], &[]);
        let files = node_group_config(&cluster, &cluster.spec.node_groups[0]).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[OPENSEARCH_CONFIG_FILE], INJECTED_OPENSEARCH_CONFIG);
    }

    #[test]
    fn layers_merge_with_later_winning() {
        let cluster = cluster(
            &[
                ("opensearch.yml", "node.value: global\nnode.value2: test2\n"),
                ("log4j.yml", "rootLogger: info\n"),
            ],
            &[(
                "opensearch.yml",
                "node:\n  name: test\n  value: test\n  roles:\n    - master\n",
            )],
        );
        let files = node_group_config(&cluster, &cluster.spec.node_groups[0]).unwrap();

        assert_eq!(files["log4j.yml"], "rootLogger: info\n");
        let merged = parse(&files[OPENSEARCH_CONFIG_FILE]);
        assert_eq!(
            merged,
            parse(
                r#"
                node:
                  name: test
                  roles:
                    - master
                  value: test
                  value2: test2
                plugins:
                  security:
                    ssl:
                      http:
                        enabled: true
                        keystore_filepath: certs/http/api.pfx
                        keystore_type: PKCS12/PFX
                        truststore_filepath: certs/http/api.pfx
                        truststore_type: PKCS12/PFX
                      transport:
                        enforce_hostname_verification: true
                        keystore_filepath: certs/transport/${hostname}.pfx
                        keystore_type: PKCS12/PFX
                        truststore_filepath: certs/transport/${hostanme}.pfx
                        truststore_type: PKCS12/PFX
                "#
            )
        );
        // Keys come out sorted, so "node" precedes "plugins"
        assert!(files[OPENSEARCH_CONFIG_FILE].starts_with("node:"));
    }

    #[test]
    fn group_overrides_injected_settings() {
        let cluster = cluster(
            &[],
            &[(
                "opensearch.yml",
                "plugins.security.ssl.http.enabled: false\n",
            )],
        );
        let files = node_group_config(&cluster, &cluster.spec.node_groups[0]).unwrap();
        let merged = parse(&files[OPENSEARCH_CONFIG_FILE]);
        assert_eq!(
            merged["plugins"]["security"]["ssl"]["http"]["enabled"],
            Value::Bool(false)
        );
        assert_eq!(
            merged["plugins"]["security"]["ssl"]["http"]["keystore_type"],
            Value::String("PKCS12/PFX".to_string())
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let cluster = cluster(
            &[("opensearch.yml", "b: 1\na: 2\n")],
            &[("opensearch.yml", "c.d: 3\n")],
        );
        let group = &cluster.spec.node_groups[0];
        assert_eq!(
            node_group_config(&cluster, group).unwrap(),
            node_group_config(&cluster, group).unwrap()
        );
    }

    #[test]
    fn invalid_yaml_is_reported() {
        let cluster = cluster(&[("opensearch.yml", "a: [unterminated\n")], &[]);
        assert!(matches!(
            node_group_config(&cluster, &cluster.spec.node_groups[0]),
            Err(Error::ParseConfig { .. })
        ));
    }
}
