use std::net::IpAddr;

use openssl::{
    conf::{Conf, ConfMethod},
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
        X509Builder, X509Req, X509ReqBuilder, X509,
    },
};
use snafu::ResultExt;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{
    ca::{build_name, random_serial, NOT_BEFORE_SKEW},
    to_asn1_time, CertificateAuthority, EncodingFailedSnafu, KeygenFailedSnafu, RenewalPolicy,
    Result, SignatureFailedSnafu,
};

/// What a leaf certificate is issued for. Decides its subject alternative names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeafKind {
    /// A transport node, reachable under its own identity.
    Node,
    /// The admin client certificate, without any SAN.
    Admin,
    /// The HTTP endpoint.
    Api {
        alt_names: Vec<String>,
        alt_ips: Vec<String>,
    },
}

pub struct IssuedLeaf {
    pub certificate: X509,
    pub private_key: PKey<Private>,
    pub csr: X509Req,
}

impl IssuedLeaf {
    pub fn certificate_pem(&self) -> Result<Vec<u8>> {
        self.certificate
            .to_pem()
            .context(EncodingFailedSnafu { what: "certificate" })
    }

    pub fn private_key_pem(&self) -> Result<Vec<u8>> {
        self.private_key
            .private_key_to_pem_pkcs8()
            .context(EncodingFailedSnafu { what: "private key" })
    }

    pub fn csr_pem(&self) -> Result<Vec<u8>> {
        self.csr.to_pem().context(EncodingFailedSnafu {
            what: "certificate signing request",
        })
    }
}

impl CertificateAuthority {
    /// Issues a certificate for `common_name`, signed by this CA and valid for the
    /// policy's validity.
    pub fn issue_leaf(
        &self,
        common_name: &str,
        kind: &LeafKind,
        policy: &RenewalPolicy,
    ) -> Result<IssuedLeaf> {
        let now = OffsetDateTime::now_utc();
        let not_before = now - NOT_BEFORE_SKEW;
        let not_after = now + policy.validity;
        let subject_name = build_name(common_name, &self.purpose.leaf_identity())
            .context(SignatureFailedSnafu { what: "certificate" })?;
        let private_key = Rsa::generate(policy.key_bit_size)
            .and_then(PKey::try_from)
            .context(KeygenFailedSnafu)?;

        let csr = X509ReqBuilder::new()
            .and_then(|mut req| {
                req.set_subject_name(&subject_name)?;
                req.set_pubkey(&private_key)?;
                req.sign(&private_key, MessageDigest::sha256())?;
                Ok(req)
            })
            .context(SignatureFailedSnafu {
                what: "certificate signing request",
            })?
            .build();

        let (dns_names, ips) = subject_alt_names(common_name, kind);
        let certificate = X509Builder::new()
            .and_then(|mut x509| {
                let conf = Conf::new(ConfMethod::default())?;
                x509.set_subject_name(&subject_name)?;
                x509.set_issuer_name(self.certificate.subject_name())?;
                x509.set_not_before(to_asn1_time(not_before)?.as_ref())?;
                x509.set_not_after(to_asn1_time(not_after)?.as_ref())?;
                x509.set_pubkey(&private_key)?;
                x509.set_version(
                    3 - 1, // zero-indexed
                )?;
                x509.set_serial_number(random_serial()?.as_ref())?;
                let ctx = x509.x509v3_context(Some(&self.certificate), Some(&conf));
                let mut exts = vec![
                    BasicConstraints::new().critical().build()?,
                    KeyUsage::new()
                        .key_encipherment()
                        .digital_signature()
                        .build()?,
                    ExtendedKeyUsage::new()
                        .server_auth()
                        .client_auth()
                        .build()?,
                    SubjectKeyIdentifier::new().build(&ctx)?,
                    AuthorityKeyIdentifier::new()
                        .issuer(true)
                        .keyid(true)
                        .build(&ctx)?,
                ];
                if !dns_names.is_empty() || !ips.is_empty() {
                    let mut san_ext = SubjectAlternativeName::new();
                    for dns in &dns_names {
                        san_ext.dns(dns);
                    }
                    for ip in &ips {
                        san_ext.ip(&ip.to_string());
                    }
                    exts.push(san_ext.build(&ctx)?);
                }
                for ext in exts {
                    x509.append_extension(ext)?;
                }
                x509.sign(&self.private_key, MessageDigest::sha256())?;
                Ok(x509)
            })
            .context(SignatureFailedSnafu { what: "certificate" })?
            .build();

        debug!(common_name, ?kind, "issued leaf certificate");
        Ok(IssuedLeaf {
            certificate,
            private_key,
            csr,
        })
    }
}

fn subject_alt_names(common_name: &str, kind: &LeafKind) -> (Vec<String>, Vec<IpAddr>) {
    match kind {
        LeafKind::Admin => (Vec::new(), Vec::new()),
        LeafKind::Node => (vec![common_name.to_string()], Vec::new()),
        LeafKind::Api { alt_names, alt_ips } => {
            let mut dns_names = vec![common_name.to_string()];
            for name in alt_names {
                if !dns_names.contains(name) {
                    dns_names.push(name.clone());
                }
            }
            let ips = alt_ips
                .iter()
                .filter_map(|ip| match ip.parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(ip, "ignoring invalid IP subject alternative name");
                        None
                    }
                })
                .collect();
            (dns_names, ips)
        }
    }
}

#[cfg(test)]
mod tests {
    use openssl::nid::Nid;

    use super::*;
    use crate::pki::{Purpose, ADMIN_COMMON_NAME};

    fn san_dns_names(cert: &X509) -> Vec<String> {
        cert.subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn san_ips(cert: &X509) -> Vec<Vec<u8>> {
        cert.subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.ipaddress().map(<[u8]>::to_vec))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn node_certificate_is_signed_by_ca() {
        let policy = RenewalPolicy::default();
        let ca = CertificateAuthority::new_root(Purpose::Transport, &policy).unwrap();
        let leaf = ca
            .issue_leaf("test-master-os-0", &LeafKind::Node, &policy)
            .unwrap();
        assert!(leaf
            .certificate
            .verify(&ca.certificate().public_key().unwrap())
            .unwrap());
        assert_eq!(
            leaf.certificate
                .subject_name()
                .entries_by_nid(Nid::ORGANIZATIONALUNITNAME)
                .next()
                .unwrap()
                .data()
                .as_utf8()
                .unwrap()
                .to_string(),
            "Opensearch node"
        );
        assert_eq!(san_dns_names(&leaf.certificate), vec!["test-master-os-0"]);
        assert!(leaf.csr.verify(&leaf.private_key).unwrap());
        assert!(leaf
            .certificate
            .public_key()
            .unwrap()
            .public_eq(&leaf.private_key));
    }

    #[test]
    fn admin_certificate_has_no_san() {
        let policy = RenewalPolicy::default();
        let ca = CertificateAuthority::new_root(Purpose::Transport, &policy).unwrap();
        let leaf = ca
            .issue_leaf(ADMIN_COMMON_NAME, &LeafKind::Admin, &policy)
            .unwrap();
        assert!(leaf.certificate.subject_alt_names().is_none());
    }

    #[test]
    fn api_certificate_carries_alt_names_and_ips() {
        let policy = RenewalPolicy::default();
        let ca = CertificateAuthority::new_root(Purpose::Api, &policy).unwrap();
        let kind = LeafKind::Api {
            alt_names: vec!["search.example.com".to_string(), "test-os".to_string()],
            alt_ips: vec!["10.0.0.1".to_string(), "not-an-ip".to_string()],
        };
        let leaf = ca.issue_leaf("test-os", &kind, &policy).unwrap();
        assert_eq!(
            san_dns_names(&leaf.certificate),
            vec!["test-os", "search.example.com"]
        );
        assert_eq!(san_ips(&leaf.certificate), vec![vec![10, 0, 0, 1]]);
    }

    #[test]
    fn pem_encodings_parse_back() {
        let policy = RenewalPolicy::default();
        let ca = CertificateAuthority::new_root(Purpose::Transport, &policy).unwrap();
        let leaf = ca
            .issue_leaf("test-data-os-1", &LeafKind::Node, &policy)
            .unwrap();
        X509::from_pem(&leaf.certificate_pem().unwrap()).unwrap();
        PKey::private_key_from_pem(&leaf.private_key_pem().unwrap()).unwrap();
        X509Req::from_pem(&leaf.csr_pem().unwrap()).unwrap();
    }
}
