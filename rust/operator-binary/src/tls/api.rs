//! Client facing HTTPS material.
//!
//! Unless the load balancer points at a user managed secret, the operator keeps its own
//! CA and a single API certificate. Rotation replaces both at once.

use openssl::x509::{X509Ref, X509};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::Condition},
    kube::ResourceExt,
};
use tracing::{info, warn};

use super::{
    build_secret, insert_leaf, insert_root_ca, load_root_ca, secret_field, tracked,
    SecretChange, SecretData, SecretStoreError, TlsContext, CA_PREFIX,
};
use crate::{
    crd::Opensearch,
    metrics::API_TLS_CONTROLLER,
    pki::{self, CertificateAuthority, LeafKind, Purpose, RenewalPolicy},
    render::naming,
    status::API_TLS_CONDITION,
};

pub const API_PREFIX: &str = "api";

/// Fields a user managed secret must carry.
pub const TLS_KEY_FIELD: &str = "tls.key";
pub const TLS_CERTIFICATE_FIELD: &str = "tls.crt";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read API secret"))]
    ReadSecret { source: SecretStoreError },

    #[snafu(display("failed to load API CA"))]
    LoadRootCa { source: pki::Error },

    #[snafu(display("failed to load certificate {key}"))]
    LoadCertificate {
        source: openssl::error::ErrorStack,
        key: String,
    },

    #[snafu(display("failed to check whether {name} needs renewal"))]
    CheckRenewal { source: pki::Error, name: String },

    #[snafu(display("failed to create API CA"))]
    CreateRootCa { source: pki::Error },

    #[snafu(display("failed to issue API certificate"))]
    IssueCertificate { source: pki::Error },

    #[snafu(display("failed to store {name}"))]
    StoreCertificate { source: pki::Error, name: String },

    #[snafu(display("failed to write API secret"))]
    WriteSecret { source: SecretStoreError },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiDiff {
    Create,
    /// The CA or the API certificate is stale, both are replaced.
    Rotate,
    NoOp,
}

fn needs_renewal(policy: &RenewalPolicy, cert: &X509Ref, name: &str) -> Result<bool> {
    policy
        .needs_renewal(cert)
        .context(CheckRenewalSnafu { name })
}

fn diff(current: Option<&Secret>, policy: &RenewalPolicy) -> Result<ApiDiff> {
    let Some(current) = current else {
        return Ok(ApiDiff::Create);
    };
    let ca = load_root_ca(Purpose::Api, current).context(LoadRootCaSnafu)?;
    if needs_renewal(policy, ca.certificate(), CA_PREFIX)? {
        return Ok(ApiDiff::Rotate);
    }

    let key = format!("{API_PREFIX}.crt");
    let Some(pem) = secret_field(current, &key) else {
        return Ok(ApiDiff::Rotate);
    };
    let certificate = X509::from_pem(pem).context(LoadCertificateSnafu { key: &key })?;
    Ok(if needs_renewal(policy, &certificate, API_PREFIX)? {
        ApiDiff::Rotate
    } else {
        ApiDiff::NoOp
    })
}

fn generate_bundle(cluster: &Opensearch, policy: &RenewalPolicy) -> Result<SecretData> {
    let ca = CertificateAuthority::new_root(Purpose::Api, policy).context(CreateRootCaSnafu)?;
    let self_signed = cluster.api_self_signed_certificate();
    let kind = LeafKind::Api {
        alt_names: self_signed
            .map(|spec| spec.alt_names.clone())
            .unwrap_or_default(),
        alt_ips: self_signed
            .map(|spec| spec.alt_ips.clone())
            .unwrap_or_default(),
    };
    let leaf = ca
        .issue_leaf(&cluster.name_any(), &kind, policy)
        .context(IssueCertificateSnafu)?;

    let mut data = SecretData::new();
    insert_root_ca(&mut data, &ca).context(StoreCertificateSnafu { name: CA_PREFIX })?;
    insert_leaf(&mut data, API_PREFIX, &leaf, &[])
        .context(StoreCertificateSnafu { name: API_PREFIX })?;
    Ok(data)
}

/// Only checks that the user secret is usable.
async fn check_external_secret(ctx: &TlsContext<'_>, secret_name: &str) -> Result<SecretChange> {
    let requeue = SecretChange::Requeue(ctx.config.requeue);
    let Some(secret) = ctx
        .secrets
        .get(secret_name)
        .await
        .context(ReadSecretSnafu)?
    else {
        warn!(secret = secret_name, "API secret does not exist yet, retrying later");
        return Ok(requeue);
    };
    for field in [TLS_KEY_FIELD, TLS_CERTIFICATE_FIELD] {
        if secret_field(&secret, field).is_none() {
            warn!(
                secret = secret_name,
                field,
                "API secret lacks a required field, retrying later"
            );
            return Ok(requeue);
        }
    }
    Ok(SecretChange::Unchanged)
}

async fn reconcile_managed_secret(
    ctx: &TlsContext<'_>,
    cluster: &Opensearch,
    secret_name: &str,
) -> Result<SecretChange> {
    let policy = &ctx.config.policy;
    let current = ctx
        .secrets
        .get(secret_name)
        .await
        .context(ReadSecretSnafu)?;

    match (diff(current.as_ref(), policy)?, current) {
        (ApiDiff::NoOp, _) => Ok(SecretChange::Unchanged),
        (ApiDiff::Create, _) | (_, None) => {
            info!(secret = secret_name, "creating API PKI");
            let secret = build_secret(cluster, secret_name, generate_bundle(cluster, policy)?);
            ctx.secrets
                .create(&secret)
                .await
                .context(WriteSecretSnafu)?;
            Ok(SecretChange::Created)
        }
        (ApiDiff::Rotate, Some(current)) => {
            info!(secret = secret_name, "renewing API PKI");
            let mut secret = build_secret(cluster, secret_name, generate_bundle(cluster, policy)?);
            secret.metadata.resource_version = current.resource_version();
            ctx.secrets
                .replace(&secret)
                .await
                .context(WriteSecretSnafu)?;
            Ok(SecretChange::Updated)
        }
    }
}

/// Keeps the API secret usable and records the result in `conditions`.
///
/// A user managed secret that is missing, or lacks `tls.key` or `tls.crt`, asks for a
/// requeue without touching the condition.
pub async fn reconcile(
    ctx: &TlsContext<'_>,
    cluster: &Opensearch,
    conditions: &mut Vec<Condition>,
) -> Result<SecretChange> {
    let secret_name = naming::api_secret_name(cluster);
    let pass = async {
        if cluster.is_self_managed_secret_for_tls_api() {
            reconcile_managed_secret(ctx, cluster, &secret_name).await
        } else {
            check_external_secret(ctx, &secret_name).await
        }
    };
    tracked(
        ctx,
        cluster,
        conditions,
        API_TLS_CONTROLLER,
        API_TLS_CONDITION,
        &secret_name,
        pass,
    )
    .await
}
