//! Reconcilers keeping the transport and API TLS secrets of a cluster up to date.
//!
//! Both reconcilers follow the same pass: read the current secret, decide on a single
//! change, write it back with one request, then report a condition and an event.

use std::{collections::BTreeMap, future::Future, time::Duration};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::Condition, ByteString,
    },
    kube::{
        api::{Api, PostParams},
        runtime::events::EventType,
        Client, Resource, ResourceExt,
    },
};
use tracing::debug;

use crate::{
    crd::Opensearch,
    events::{reasons, EventPublisher},
    metrics::Metrics,
    pki::{
        self, encode_keystore, CertificateAuthority, IssuedLeaf, Purpose, RenewalPolicy,
        RootCaBundle,
    },
    render::{cluster_selector, object_meta},
    status::{self, initialize_condition, is_condition_true, set_condition},
    utils::error_full_message,
};

pub mod api;
pub mod transport;

pub const CA_PREFIX: &str = "ca";

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum SecretStoreError {
    #[snafu(display("failed to get secret {name}"))]
    Get {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to create secret {name}"))]
    Create {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("failed to replace secret {name}"))]
    Replace {
        source: stackable_operator::kube::Error,
        name: String,
    },

    #[snafu(display("secret {name} was modified since it was read"))]
    Conflict { name: String },
}

/// Access to the secrets of one namespace.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns `None` when the secret does not exist.
    async fn get(&self, name: &str) -> Result<Option<Secret>, SecretStoreError>;

    async fn create(&self, secret: &Secret) -> Result<Secret, SecretStoreError>;

    /// Replaces an existing secret. The `resourceVersion` of `secret` must still be current.
    async fn replace(&self, secret: &Secret) -> Result<Secret, SecretStoreError>;
}

pub struct KubeSecretStore {
    api: Api<Secret>,
}

impl KubeSecretStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str) -> Result<Option<Secret>, SecretStoreError> {
        self.api
            .get_opt(name)
            .await
            .context(secret_store_error::GetSnafu { name })
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, SecretStoreError> {
        self.api
            .create(&PostParams::default(), secret)
            .await
            .context(secret_store_error::CreateSnafu {
                name: secret.name_any(),
            })
    }

    async fn replace(&self, secret: &Secret) -> Result<Secret, SecretStoreError> {
        let name = secret.name_any();
        self.api
            .replace(&name, &PostParams::default(), secret)
            .await
            .context(secret_store_error::ReplaceSnafu { name: &name })
    }
}

/// Settings shared by both TLS reconcilers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconcilerConfig {
    pub policy: RenewalPolicy,
    /// Delay before looking again at a user secret that is not usable yet.
    pub requeue: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            policy: RenewalPolicy::default(),
            requeue: Duration::from_secs(60),
        }
    }
}

/// Collaborators of a TLS reconcile pass.
pub struct TlsContext<'a> {
    pub secrets: &'a dyn SecretStore,
    pub events: &'a dyn EventPublisher,
    pub metrics: &'a Metrics,
    pub config: &'a ReconcilerConfig,
}

/// What a pass did to its secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretChange {
    Created,
    Updated,
    Unchanged,
    /// The secret is not usable yet, look again later.
    Requeue(Duration),
}

impl SecretChange {
    pub fn requeue_after(self) -> Option<Duration> {
        match self {
            SecretChange::Requeue(after) => Some(after),
            _ => None,
        }
    }
}

/// Wraps one reconcile pass with condition, event and metric bookkeeping.
///
/// The cluster is counted for `controller` on every pass, so the count is rebuilt after
/// a restart. The condition is initialized on first sight, set to `Success` once the pass went
/// through and to `Failed` with the full error message otherwise. A pass that asks for
/// a requeue leaves the condition alone.
pub(crate) async fn tracked<E>(
    ctx: &TlsContext<'_>,
    cluster: &Opensearch,
    conditions: &mut Vec<Condition>,
    controller: &str,
    condition_type: &str,
    secret_name: &str,
    pass: impl Future<Output = Result<SecretChange, E>>,
) -> Result<SecretChange, E>
where
    E: std::error::Error + 'static,
{
    let generation = cluster.meta().generation;
    initialize_condition(conditions, condition_type, generation);
    if let Some(uid) = cluster.uid() {
        ctx.metrics.track_resource(controller, &uid);
    }
    let resource_ref = cluster.object_ref(&());

    match pass.await {
        Ok(change) => {
            let note = match change {
                SecretChange::Created => {
                    Some(format!("Secret {secret_name} successfully created"))
                }
                SecretChange::Updated => {
                    Some(format!("Secret {secret_name} successfully updated"))
                }
                SecretChange::Unchanged | SecretChange::Requeue(_) => None,
            };
            if let Some(note) = note {
                ctx.events
                    .publish(&resource_ref, EventType::Normal, reasons::COMPLETED, note)
                    .await;
            }
            if change.requeue_after().is_none()
                && !is_condition_true(conditions, condition_type)
            {
                set_condition(
                    conditions,
                    condition_type,
                    true,
                    status::reasons::SUCCESS,
                    format!("Secret {secret_name} up to date"),
                    generation,
                );
            }
            Ok(change)
        }
        Err(error) => {
            let message = error_full_message(&error);
            ctx.events
                .publish(&resource_ref, EventType::Warning, reasons::FAILED, message.clone())
                .await;
            set_condition(
                conditions,
                condition_type,
                false,
                status::reasons::FAILED,
                message,
                generation,
            );
            ctx.metrics.record_error();
            Err(error)
        }
    }
}

/// Returns the field when it is present and not empty.
pub(crate) fn secret_field<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.as_slice())
        .filter(|value| !value.is_empty())
}

fn field_or_empty(secret: &Secret, key: &str) -> Vec<u8> {
    secret_field(secret, key).map(<[u8]>::to_vec).unwrap_or_default()
}

/// Loads the root CA stored under the `ca.*` keys.
pub(crate) fn load_root_ca(
    purpose: Purpose,
    secret: &Secret,
) -> pki::Result<CertificateAuthority> {
    CertificateAuthority::load(
        purpose,
        &RootCaBundle {
            private_key: field_or_empty(secret, "ca.key"),
            public_key: field_or_empty(secret, "ca.pub"),
            certificate: field_or_empty(secret, "ca.crt"),
            crl: field_or_empty(secret, "ca.crl"),
        },
    )
}

pub(crate) type SecretData = BTreeMap<String, ByteString>;

pub(crate) fn insert_root_ca(data: &mut SecretData, ca: &CertificateAuthority) -> pki::Result<()> {
    let bundle = ca.bundle()?;
    for (suffix, value) in [
        ("key", bundle.private_key),
        ("pub", bundle.public_key),
        ("crt", bundle.certificate),
        ("crl", bundle.crl),
    ] {
        data.insert(format!("{CA_PREFIX}.{suffix}"), ByteString(value));
    }
    Ok(())
}

/// Stores `{prefix}.crt`, `.key`, `.csr` and the `.pfx` keystore carrying `extra_cas`.
pub(crate) fn insert_leaf(
    data: &mut SecretData,
    prefix: &str,
    leaf: &IssuedLeaf,
    extra_cas: &[openssl::x509::X509],
) -> pki::Result<()> {
    debug!(leaf = prefix, extra_cas = extra_cas.len(), "storing certificate");
    data.insert(format!("{prefix}.crt"), ByteString(leaf.certificate_pem()?));
    data.insert(format!("{prefix}.key"), ByteString(leaf.private_key_pem()?));
    data.insert(format!("{prefix}.csr"), ByteString(leaf.csr_pem()?));
    data.insert(
        format!("{prefix}.pfx"),
        ByteString(encode_keystore(
            &leaf.private_key,
            &leaf.certificate,
            extra_cas,
        )?),
    );
    Ok(())
}

pub(crate) fn remove_leaf(data: &mut SecretData, prefix: &str) {
    for suffix in ["crt", "key", "csr", "pfx"] {
        data.remove(&format!("{prefix}.{suffix}"));
    }
}

/// An opaque secret owned by the cluster.
pub(crate) fn build_secret(cluster: &Opensearch, name: &str, data: SecretData) -> Secret {
    Secret {
        metadata: object_meta(
            cluster,
            name.to_string(),
            cluster_selector(cluster),
            BTreeMap::new(),
        ),
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}
