use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::{
        api::{
            core::v1::{
                EnvFromSource, EnvVar, LocalObjectReference, PersistentVolumeClaimSpec,
                PodTemplateSpec, ResourceRequirements, Toleration, Volume,
            },
            networking::v1::IngressSpec,
            policy::v1::PodDisruptionBudgetSpec,
        },
        apimachinery::pkg::apis::meta::v1::Condition,
    },
    kube::CustomResource,
    schemars::{self, JsonSchema},
};
use strum::{EnumIter, IntoEnumIterator};

pub const DEFAULT_IMAGE: &str = "public.ecr.aws/opensearchproject/opensearch";
pub const DEFAULT_VERSION: &str = "latest";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "opensearch.k8s.webcenter.fr",
    version = "v1alpha1",
    kind = "Opensearch",
    plural = "opensearches",
    shortname = "os",
    status = "OpensearchStatus",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    ),
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"CredentialsRef", "type":"string", "jsonPath":".status.credentialsRef"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase", "description":"Cluster deployment status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpensearchSpec {
    /// Container image repository, defaults to the upstream OpenSearch image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    /// OpenSearch version, used as the image tag. Defaults to `latest`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Run a privileged init container that raises `vm.max_map_count` on the host.
    /// Defaults to `true`.
    #[serde(
        default,
        rename = "setVMMaxMapCount",
        skip_serializing_if = "Option::is_none"
    )]
    pub set_vm_max_map_count: Option<bool>,

    /// Plugins installed on every node before OpenSearch starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins_list: Vec<String>,

    /// Defaults shared by every node group.
    #[serde(default)]
    pub global_node_group: GlobalNodeGroupSpec,

    #[serde(default)]
    pub node_groups: Vec<NodeGroupSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalNodeGroupSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_volumes: Vec<AdditionalVolume>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_affinity: Option<AntiAffinitySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PodDisruptionBudgetSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_container_resources: Option<ResourceRequirements>,

    /// Merged into every rendered pod template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplateSpec>,

    /// Extra JVM options. Heap sizing is left to OpenSearch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm: Option<String>,

    /// Configuration files, keyed by file name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,

    /// Secret holding the OpenSearch security plugin configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    pub name: String,

    #[serde(default)]
    pub replicas: u16,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<NodeRole>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_affinity: Option<AntiAffinitySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_container_resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplateSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PodDisruptionBudgetSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_ref: Option<String>,
}

/// Node roles understood by OpenSearch. Declaration order is the order in which
/// the role environment variables are rendered.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    JsonSchema,
    EnumIter,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeRole {
    ClusterManager,
    Data,
    Ingest,
    Ml,
    RemoteClusterClient,
    Transform,
}

impl NodeRole {
    pub fn vocabulary() -> impl Iterator<Item = NodeRole> {
        NodeRole::iter()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_spec: Option<PersistentVolumeClaimSpec>,

    /// Inline volume used instead of a claim, e.g. a `hostPath`. Its name is
    /// replaced when rendered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AntiAffinitySpec {
    /// `hard` for a required rule, anything else for a preferred one.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_key: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalVolume {
    #[serde(flatten)]
    pub volume: Volume,

    pub mount_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressEndpointSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressEndpointSpec {
    #[serde(default)]
    pub enabled: bool,

    /// Node group receiving the traffic. Defaults to every node of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_group_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Secret holding the certificate served by the ingress controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Merged into the rendered ingress spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_spec: Option<IngressSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_group_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<LoadBalancerTlsSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerTlsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed_certificate: Option<SelfSignedCertificateSpec>,

    /// User managed secret carrying `tls.key` and `tls.crt`. When set, the operator
    /// stops managing the API certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_secret_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SelfSignedCertificateSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_ips: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpensearchStatus {
    #[serde(default)]
    pub phase: String,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub credentials_ref: String,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Opensearch {
    pub fn ingress(&self) -> Option<&IngressEndpointSpec> {
        self.spec
            .endpoint
            .as_ref()
            .and_then(|endpoint| endpoint.ingress.as_ref())
            .filter(|ingress| ingress.enabled)
    }

    pub fn load_balancer(&self) -> Option<&LoadBalancerSpec> {
        self.spec
            .endpoint
            .as_ref()
            .and_then(|endpoint| endpoint.load_balancer.as_ref())
            .filter(|lb| lb.enabled)
    }

    pub fn is_ingress_enabled(&self) -> bool {
        self.ingress().is_some()
    }

    pub fn is_load_balancer_enabled(&self) -> bool {
        self.load_balancer().is_some()
    }

    /// The user managed API certificate secret, if the cluster declares one.
    pub fn external_api_secret(&self) -> Option<&str> {
        self.load_balancer()
            .and_then(|lb| lb.tls.as_ref())
            .and_then(|tls| tls.certificate_secret_ref.as_deref())
            .filter(|name| !name.is_empty())
    }

    /// Returns `true` when the operator owns the API certificates.
    pub fn is_self_managed_secret_for_tls_api(&self) -> bool {
        self.external_api_secret().is_none()
    }

    pub fn api_self_signed_certificate(&self) -> Option<&SelfSignedCertificateSpec> {
        self.load_balancer()
            .and_then(|lb| lb.tls.as_ref())
            .and_then(|tls| tls.self_signed_certificate.as_ref())
    }

    pub fn container_image(&self) -> String {
        format!(
            "{}:{}",
            self.spec
                .image
                .as_deref()
                .filter(|image| !image.is_empty())
                .unwrap_or(DEFAULT_IMAGE),
            self.spec
                .version
                .as_deref()
                .filter(|version| !version.is_empty())
                .unwrap_or(DEFAULT_VERSION),
        )
    }

    pub fn set_vm_max_map_count(&self) -> bool {
        self.spec.set_vm_max_map_count.unwrap_or(true)
    }

    pub fn node_group(&self, name: &str) -> Option<&NodeGroupSpec> {
        self.spec.node_groups.iter().find(|group| group.name == name)
    }
}

impl NodeGroupSpec {
    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }
}
