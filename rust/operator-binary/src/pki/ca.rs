use openssl::{
    asn1::Asn1Integer,
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectKeyIdentifier},
        X509Builder, X509Crl, X509Name, X509NameBuilder, X509Ref, X509,
    },
};
use snafu::{ensure, ResultExt};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use super::{
    crl, invalid_bundle_error, to_asn1_time, EncodingFailedSnafu, Identity, KeygenFailedSnafu,
    Purpose, RenewalPolicy, Result, SignatureFailedSnafu, ROOT_CA_COMMON_NAME,
};

/// Backdating applied to every `notBefore`, to tolerate clock skew between nodes.
pub(super) const NOT_BEFORE_SKEW: Duration = Duration::minutes(5);

/// The PEM encoded parts of a root CA, as stored in the `ca.*` keys of a TLS secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootCaBundle {
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
    pub certificate: Vec<u8>,
    pub crl: Vec<u8>,
}

/// A self-signed root that can issue leaf certificates.
pub struct CertificateAuthority {
    pub(super) purpose: Purpose,
    pub(super) certificate: X509,
    pub(super) private_key: PKey<Private>,
    crl: Vec<u8>,
}

impl CertificateAuthority {
    /// Generates a fresh key pair, a self-signed CA certificate and an empty CRL.
    pub fn new_root(purpose: Purpose, policy: &RenewalPolicy) -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        let not_before = now - NOT_BEFORE_SKEW;
        let not_after = now + policy.validity;
        let subject_name = build_name(ROOT_CA_COMMON_NAME, &purpose.ca_identity())
            .context(SignatureFailedSnafu {
                what: "CA certificate",
            })?;
        let private_key = Rsa::generate(policy.key_bit_size)
            .and_then(PKey::try_from)
            .context(KeygenFailedSnafu)?;
        let certificate = X509Builder::new()
            .and_then(|mut x509| {
                let conf = Conf::new(ConfMethod::default())?;
                x509.set_subject_name(&subject_name)?;
                x509.set_issuer_name(&subject_name)?;
                x509.set_not_before(to_asn1_time(not_before)?.as_ref())?;
                x509.set_not_after(to_asn1_time(not_after)?.as_ref())?;
                x509.set_pubkey(&private_key)?;
                x509.set_serial_number(random_serial()?.as_ref())?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                let ctx = x509.x509v3_context(None, Some(&conf));
                let exts = [
                    BasicConstraints::new().critical().ca().build()?,
                    SubjectKeyIdentifier::new().build(&ctx)?,
                    AuthorityKeyIdentifier::new()
                        .issuer(false)
                        .keyid(false)
                        .build(&ctx)?,
                    KeyUsage::new()
                        .critical()
                        .digital_signature()
                        .key_cert_sign()
                        .crl_sign()
                        .build()?,
                ];
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&private_key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(SignatureFailedSnafu {
                what: "CA certificate",
            })?
            .build();
        let crl = crl::build_empty_crl(&certificate, &private_key, now, not_after)?;
        debug!(%purpose, "generated new root CA");
        Ok(Self {
            purpose,
            certificate,
            private_key,
            crl,
        })
    }

    /// Parses and cross-checks a previously generated bundle.
    pub fn load(purpose: Purpose, bundle: &RootCaBundle) -> Result<Self> {
        use invalid_bundle_error::*;
        for (field, value) in [
            ("ca.key", &bundle.private_key),
            ("ca.pub", &bundle.public_key),
            ("ca.crt", &bundle.certificate),
            ("ca.crl", &bundle.crl),
        ] {
            ensure!(!value.is_empty(), MissingFieldSnafu { field });
        }
        let private_key = PKey::private_key_from_pem(&bundle.private_key)
            .context(LoadFieldSnafu { field: "ca.key" })?;
        let public_key = PKey::public_key_from_pem(&bundle.public_key)
            .context(LoadFieldSnafu { field: "ca.pub" })?;
        let certificate =
            X509::from_pem(&bundle.certificate).context(LoadFieldSnafu { field: "ca.crt" })?;
        let crl = X509Crl::from_pem(&bundle.crl).context(LoadFieldSnafu { field: "ca.crl" })?;

        ensure!(
            public_key.public_eq(&private_key),
            KeyMismatchSnafu { field: "ca.pub" }
        );
        let cert_key = certificate
            .public_key()
            .context(LoadFieldSnafu { field: "ca.crt" })?;
        ensure!(
            cert_key.public_eq(&private_key),
            KeyMismatchSnafu { field: "ca.crt" }
        );
        ensure!(
            crl.verify(&public_key)
                .context(LoadFieldSnafu { field: "ca.crl" })?,
            CrlSignatureSnafu
        );

        Ok(Self {
            purpose,
            certificate,
            private_key,
            crl: bundle.crl.clone(),
        })
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub fn bundle(&self) -> Result<RootCaBundle> {
        Ok(RootCaBundle {
            private_key: self
                .private_key
                .private_key_to_pem_pkcs8()
                .context(EncodingFailedSnafu {
                    what: "CA private key",
                })?,
            public_key: self
                .private_key
                .public_key_to_pem()
                .context(EncodingFailedSnafu {
                    what: "CA public key",
                })?,
            certificate: self.certificate.to_pem().context(EncodingFailedSnafu {
                what: "CA certificate",
            })?,
            crl: self.crl.clone(),
        })
    }
}

pub(super) fn build_name(common_name: &str, identity: &Identity) -> Result<X509Name, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, identity.organization)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, identity.organizational_unit)?;
    name.append_entry_by_nid(Nid::COUNTRYNAME, identity.country)?;
    name.append_entry_by_nid(Nid::LOCALITYNAME, identity.locality)?;
    name.append_entry_by_nid(Nid::STATEORPROVINCENAME, identity.province)?;
    Ok(name.build())
}

pub(super) fn random_serial() -> Result<Asn1Integer, ErrorStack> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Asn1Integer::from_bn(&serial)
}
