//! Node to node TLS material.
//!
//! The transport secret holds the root CA, an admin client certificate and one
//! certificate per node identity. When the CA has to be replaced, every keystore of the
//! new generation also carries the previous, still valid, CA certificates so that nodes
//! can be restarted one at a time without splitting trust.

use std::collections::{BTreeMap, BTreeSet};

use openssl::x509::{X509Ref, X509};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::Condition},
    kube::ResourceExt,
};
use time::OffsetDateTime;
use tracing::info;

use super::{
    build_secret, insert_leaf, insert_root_ca, load_root_ca, remove_leaf, secret_field, tracked,
    SecretChange, SecretData, SecretStoreError, TlsContext, CA_PREFIX,
};
use crate::{
    crd::Opensearch,
    metrics::TRANSPORT_TLS_CONTROLLER,
    pki::{
        self, decode_keystore, retain_unexpired, CertificateAuthority, LeafKind, Purpose,
        RenewalPolicy, ADMIN_COMMON_NAME,
    },
    render::naming,
    status::TRANSPORT_TLS_CONDITION,
};

pub const ADMIN_PREFIX: &str = "admin";

const LEAF_SUFFIXES: [&str; 4] = ["crt", "key", "csr", "pfx"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read transport secret"))]
    ReadSecret { source: SecretStoreError },

    #[snafu(display("failed to load transport CA"))]
    LoadRootCa { source: pki::Error },

    #[snafu(display("failed to load certificate {key}"))]
    LoadCertificate {
        source: openssl::error::ErrorStack,
        key: String,
    },

    #[snafu(display("failed to check whether {name} needs renewal"))]
    CheckRenewal { source: pki::Error, name: String },

    #[snafu(display("failed to read the CA chain of {key}"))]
    ReadKeystore { source: pki::Error, key: String },

    #[snafu(display("failed to filter previous CA certificates"))]
    FilterPreviousCas { source: pki::Error },

    #[snafu(display("failed to create transport CA"))]
    CreateRootCa { source: pki::Error },

    #[snafu(display("failed to issue certificate for {name}"))]
    IssueCertificate { source: pki::Error, name: String },

    #[snafu(display("failed to store certificate for {name}"))]
    StoreCertificate { source: pki::Error, name: String },

    #[snafu(display("failed to write transport secret"))]
    WriteSecret { source: SecretStoreError },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The single change a pass applies to the transport secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportDiff {
    /// No secret yet.
    Create,
    /// The CA or a node certificate needs renewal, every certificate is reissued.
    FullRotate,
    /// Node identities were added or removed. The admin certificate is refreshed on the
    /// way when it is stale.
    FillIn {
        missing: Vec<String>,
        pruned: Vec<String>,
        refresh_admin: bool,
    },
    AdminRefresh,
    NoOp,
}

/// The decoded transport secret.
struct CurrentBundle {
    secret: Secret,
    ca: CertificateAuthority,
    admin: Option<X509>,
    /// Every expected node identity, `None` when it has no certificate yet.
    nodes: BTreeMap<String, Option<X509>>,
    /// Node identities stored in the secret that are no longer part of the cluster.
    stale: Vec<String>,
}

fn load_certificate(secret: &Secret, name: &str) -> Result<Option<X509>> {
    let key = format!("{name}.crt");
    secret_field(secret, &key)
        .map(|pem| X509::from_pem(pem).context(LoadCertificateSnafu { key: &key }))
        .transpose()
}

fn read_bundle(secret: Secret, expected_nodes: &[String]) -> Result<CurrentBundle> {
    let ca = load_root_ca(Purpose::Transport, &secret).context(LoadRootCaSnafu)?;
    let admin = load_certificate(&secret, ADMIN_PREFIX)?;
    let nodes = expected_nodes
        .iter()
        .map(|node| Ok((node.clone(), load_certificate(&secret, node)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;

    let stale = secret
        .data
        .iter()
        .flat_map(|data| data.keys())
        .filter_map(|key| {
            let (prefix, suffix) = key.rsplit_once('.')?;
            LEAF_SUFFIXES.contains(&suffix).then_some(prefix)
        })
        .filter(|prefix| {
            *prefix != CA_PREFIX && *prefix != ADMIN_PREFIX && !nodes.contains_key(*prefix)
        })
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Ok(CurrentBundle {
        secret,
        ca,
        admin,
        nodes,
        stale,
    })
}

fn needs_renewal(policy: &RenewalPolicy, cert: &X509Ref, name: &str) -> Result<bool> {
    policy
        .needs_renewal(cert)
        .context(CheckRenewalSnafu { name })
}

fn diff(current: Option<&CurrentBundle>, policy: &RenewalPolicy) -> Result<TransportDiff> {
    let Some(current) = current else {
        return Ok(TransportDiff::Create);
    };

    if needs_renewal(policy, current.ca.certificate(), CA_PREFIX)? {
        return Ok(TransportDiff::FullRotate);
    }
    let mut missing = Vec::new();
    for (node, cert) in &current.nodes {
        match cert {
            Some(cert) => {
                if needs_renewal(policy, cert, node)? {
                    return Ok(TransportDiff::FullRotate);
                }
            }
            None => missing.push(node.clone()),
        }
    }

    let refresh_admin = match &current.admin {
        Some(admin) => needs_renewal(policy, admin, ADMIN_PREFIX)?,
        None => true,
    };
    Ok(if !missing.is_empty() || !current.stale.is_empty() {
        TransportDiff::FillIn {
            missing,
            pruned: current.stale.clone(),
            refresh_admin,
        }
    } else if refresh_admin {
        TransportDiff::AdminRefresh
    } else {
        TransportDiff::NoOp
    })
}

/// Still valid CA certificates found in the chain of the admin keystore.
fn admin_chain(secret: &Secret, now: OffsetDateTime) -> Result<Vec<X509>> {
    let key = format!("{ADMIN_PREFIX}.pfx");
    let chain = match secret_field(secret, &key) {
        Some(der) => {
            decode_keystore(der)
                .context(ReadKeystoreSnafu { key: &key })?
                .ca_chain
        }
        None => Vec::new(),
    };
    retain_unexpired(chain, now).context(FilterPreviousCasSnafu)
}

fn issue_into(
    data: &mut SecretData,
    ca: &CertificateAuthority,
    name: &str,
    kind: &LeafKind,
    policy: &RenewalPolicy,
    extra_cas: &[X509],
) -> Result<()> {
    let common_name = if name == ADMIN_PREFIX {
        ADMIN_COMMON_NAME
    } else {
        name
    };
    let leaf = ca
        .issue_leaf(common_name, kind, policy)
        .context(IssueCertificateSnafu { name })?;
    insert_leaf(data, name, &leaf, extra_cas).context(StoreCertificateSnafu { name })
}

fn issue_admin(
    data: &mut SecretData,
    ca: &CertificateAuthority,
    policy: &RenewalPolicy,
    extra_cas: &[X509],
) -> Result<()> {
    issue_into(data, ca, ADMIN_PREFIX, &LeafKind::Admin, policy, extra_cas)
}

/// A complete bundle under a fresh CA, with `extra_cas` appended to every keystore.
fn generate_bundle(
    nodes: &[String],
    policy: &RenewalPolicy,
    extra_cas: &[X509],
) -> Result<SecretData> {
    let ca = CertificateAuthority::new_root(Purpose::Transport, policy)
        .context(CreateRootCaSnafu)?;
    let mut data = SecretData::new();
    insert_root_ca(&mut data, &ca).context(StoreCertificateSnafu { name: CA_PREFIX })?;
    issue_admin(&mut data, &ca, policy, extra_cas)?;
    for node in nodes {
        issue_into(&mut data, &ca, node, &LeafKind::Node, policy, extra_cas)?;
    }
    Ok(data)
}

async fn reconcile_secret(
    ctx: &TlsContext<'_>,
    cluster: &Opensearch,
    secret_name: &str,
) -> Result<SecretChange> {
    let policy = &ctx.config.policy;
    let nodes = naming::all_node_identities(cluster);
    let current = ctx
        .secrets
        .get(secret_name)
        .await
        .context(ReadSecretSnafu)?
        .map(|secret| read_bundle(secret, &nodes))
        .transpose()?;

    let now = OffsetDateTime::now_utc();
    let (data, current) = match (diff(current.as_ref(), policy)?, &current) {
        (TransportDiff::NoOp, _) => return Ok(SecretChange::Unchanged),
        (TransportDiff::Create, _) | (_, None) => {
            info!(secret = secret_name, "creating transport PKI");
            let data = generate_bundle(&nodes, policy, &[])?;
            ctx.secrets
                .create(&build_secret(cluster, secret_name, data))
                .await
                .context(WriteSecretSnafu)?;
            return Ok(SecretChange::Created);
        }
        (TransportDiff::FullRotate, Some(current)) => {
            let mut previous_cas = admin_chain(&current.secret, now)?;
            previous_cas.push(current.ca.certificate().to_owned());
            let previous_cas =
                retain_unexpired(previous_cas, now).context(FilterPreviousCasSnafu)?;
            info!(
                secret = secret_name,
                previous_cas = previous_cas.len(),
                "renewing transport PKI"
            );
            (generate_bundle(&nodes, policy, &previous_cas)?, current)
        }
        (
            TransportDiff::FillIn {
                missing,
                pruned,
                refresh_admin,
            },
            Some(current),
        ) => {
            let chain = admin_chain(&current.secret, now)?;
            let mut data = current.secret.data.clone().unwrap_or_default();
            for node in &pruned {
                remove_leaf(&mut data, node);
            }
            for node in &missing {
                issue_into(&mut data, &current.ca, node, &LeafKind::Node, policy, &chain)?;
            }
            if refresh_admin {
                issue_admin(&mut data, &current.ca, policy, &chain)?;
            }
            info!(
                secret = secret_name,
                ?missing,
                ?pruned,
                refresh_admin,
                "updating node certificates"
            );
            (data, current)
        }
        (TransportDiff::AdminRefresh, Some(current)) => {
            let chain = admin_chain(&current.secret, now)?;
            let mut data = current.secret.data.clone().unwrap_or_default();
            issue_admin(&mut data, &current.ca, policy, &chain)?;
            info!(secret = secret_name, "renewing admin certificate");
            (data, current)
        }
    };

    let mut secret = build_secret(cluster, secret_name, data);
    secret.metadata.resource_version = current.secret.resource_version();
    ctx.secrets
        .replace(&secret)
        .await
        .context(WriteSecretSnafu)?;
    Ok(SecretChange::Updated)
}

/// Brings the transport secret in line with the node identities of the cluster and
/// records the result in `conditions`.
pub async fn reconcile(
    ctx: &TlsContext<'_>,
    cluster: &Opensearch,
    conditions: &mut Vec<Condition>,
) -> Result<SecretChange> {
    let secret_name = naming::transport_secret_name(cluster);
    tracked(
        ctx,
        cluster,
        conditions,
        TRANSPORT_TLS_CONTROLLER,
        TRANSPORT_TLS_CONDITION,
        &secret_name,
        reconcile_secret(ctx, cluster, &secret_name),
    )
    .await
}
