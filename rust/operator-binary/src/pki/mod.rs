//! Certificate authorities, leaf certificates and keystores for the transport and
//! API layers.
//!
//! Everything in here is CPU bound and synchronous. Errors are never retried locally,
//! they bubble up to the reconcilers.

use openssl::{
    asn1::{Asn1Time, Asn1TimeRef, TimeDiff},
    error::ErrorStack,
    x509::{X509Ref, X509},
};
use snafu::{OptionExt, ResultExt, Snafu};
use time::{Duration, OffsetDateTime};

mod ca;
mod crl;
mod keystore;
mod leaf;

pub use ca::{CertificateAuthority, RootCaBundle};
pub use keystore::{decode_keystore, encode_keystore, DecodedKeystore};
pub use leaf::{IssuedLeaf, LeafKind};

pub const ROOT_CA_COMMON_NAME: &str = "opensearch-operator.k8s.webcenter.fr";
pub const ADMIN_COMMON_NAME: &str = "admin";

pub const DEFAULT_CERTIFICATE_VALIDITY: Duration = Duration::days(365);
pub const DEFAULT_RENEWAL_SLACK_RATIO: f64 = 0.1;
pub const DEFAULT_KEY_BIT_SIZE: u32 = 2048;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid certificate bundle"))]
    InvalidBundle { source: InvalidBundleError },

    #[snafu(display("failed to generate private key"))]
    KeygenFailed { source: openssl::error::ErrorStack },

    #[snafu(display("failed to sign {what}"))]
    SignatureFailed {
        source: openssl::error::ErrorStack,
        what: &'static str,
    },

    #[snafu(display("failed to encode {what}"))]
    EncodingFailed {
        source: openssl::error::ErrorStack,
        what: &'static str,
    },

    #[snafu(display("{datetime} cannot be encoded as a CRL update time"))]
    InvalidCrlTime { datetime: OffsetDateTime },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum InvalidBundleError {
    #[snafu(display("{field} is missing or empty"))]
    MissingField { field: String },

    #[snafu(display("failed to load {field}"))]
    LoadField {
        source: openssl::error::ErrorStack,
        field: String,
    },

    #[snafu(display("{field} does not belong to the CA private key"))]
    KeyMismatch { field: String },

    #[snafu(display("CRL is not signed by the CA"))]
    CrlSignature,

    #[snafu(display("failed to read certificate lifetime"))]
    ParseLifetime { source: LifetimeError },
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum LifetimeError {
    #[snafu(display("failed to measure the offset from the unix epoch"))]
    EpochOffset { source: ErrorStack },

    #[snafu(display("{days} days and {secs} seconds after the unix epoch is out of range"))]
    OutOfRange { days: i32, secs: i32 },
}

impl From<InvalidBundleError> for Error {
    fn from(source: InvalidBundleError) -> Self {
        Error::InvalidBundle { source }
    }
}

/// Which PKI hierarchy a CA or leaf belongs to. The identity fields are fixed per purpose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Purpose {
    Transport,
    Api,
}

/// Distinguished name fields shared by every certificate of a hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    pub organization: &'static str,
    pub organizational_unit: &'static str,
    pub country: &'static str,
    pub locality: &'static str,
    pub province: &'static str,
}

impl Purpose {
    pub fn ca_identity(self) -> Identity {
        Identity {
            organizational_unit: "Certificates Management",
            ..self.leaf_identity()
        }
    }

    pub fn leaf_identity(self) -> Identity {
        Identity {
            organization: "Opensearch Org",
            organizational_unit: match self {
                Purpose::Transport => "Opensearch node",
                Purpose::Api => "Opensearch API",
            },
            country: "US",
            locality: "TORONTO",
            province: "ONTARIO",
        }
    }
}

/// Lifetime settings for newly issued certificates, and the freshness window that
/// decides when existing ones are replaced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenewalPolicy {
    pub validity: Duration,
    pub slack: Duration,
    pub key_bit_size: u32,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self::with_slack_ratio(
            DEFAULT_CERTIFICATE_VALIDITY,
            DEFAULT_RENEWAL_SLACK_RATIO,
            DEFAULT_KEY_BIT_SIZE,
        )
    }
}

impl RenewalPolicy {
    /// Builds a policy whose slack is `ratio` times the validity. A ratio outside of
    /// `0..=1` is clamped, NaN counts as zero.
    pub fn with_slack_ratio(validity: Duration, ratio: f64, key_bit_size: u32) -> Self {
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        Self {
            validity,
            slack: validity * ratio,
            key_bit_size,
        }
    }

    pub fn needs_renewal(&self, cert: &X509Ref) -> Result<bool> {
        self.needs_renewal_at(cert, OffsetDateTime::now_utc())
    }

    /// A certificate is renewed once its remaining lifetime drops to the slack or below.
    /// Expired certificates are always renewed.
    pub fn needs_renewal_at(&self, cert: &X509Ref, now: OffsetDateTime) -> Result<bool> {
        let not_after = not_after(cert)?;
        let remaining = not_after - now;
        Ok(remaining <= Duration::ZERO || remaining <= self.slack)
    }
}

pub fn not_after(cert: &X509Ref) -> Result<OffsetDateTime> {
    to_datetime(cert.not_after())
        .context(invalid_bundle_error::ParseLifetimeSnafu)
        .map_err(Error::from)
}

/// Reads an OpenSSL time as its offset from the unix epoch.
pub(crate) fn to_datetime(time: &Asn1TimeRef) -> Result<OffsetDateTime, LifetimeError> {
    let epoch = Asn1Time::from_unix(0).context(lifetime_error::EpochOffsetSnafu)?;
    let TimeDiff { days, secs } = epoch
        .diff(time)
        .context(lifetime_error::EpochOffsetSnafu)?;
    OffsetDateTime::UNIX_EPOCH
        .checked_add(Duration::days(days.into()))
        .and_then(|datetime| datetime.checked_add(Duration::seconds(secs.into())))
        .context(lifetime_error::OutOfRangeSnafu { days, secs })
}

pub(crate) fn to_asn1_time(datetime: OffsetDateTime) -> Result<Asn1Time, ErrorStack> {
    Asn1Time::from_unix(datetime.unix_timestamp())
}

/// Keeps the certificates that are still valid at `now`, dropping duplicates.
pub fn retain_unexpired(
    certs: impl IntoIterator<Item = X509>,
    now: OffsetDateTime,
) -> Result<Vec<X509>> {
    let mut kept: Vec<X509> = Vec::new();
    let mut seen: Vec<Vec<u8>> = Vec::new();
    for cert in certs {
        if not_after(&cert)? <= now {
            continue;
        }
        let der = cert.to_der().context(EncodingFailedSnafu {
            what: "CA certificate",
        })?;
        if !seen.contains(&der) {
            seen.push(der);
            kept.push(cert);
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn short_lived(validity: Duration) -> CertificateAuthority {
        let policy = RenewalPolicy {
            validity,
            slack: Duration::ZERO,
            key_bit_size: 2048,
        };
        CertificateAuthority::new_root(Purpose::Transport, &policy).unwrap()
    }

    #[test]
    fn openssl_times_convert_both_ways() {
        let parsed = Asn1Time::from_str("20240102020304Z").unwrap();
        assert_eq!(
            to_datetime(&parsed).unwrap(),
            datetime!(2024-01-02 02:03:04 UTC)
        );

        let past_2050 = datetime!(2061-07-15 12:00:00 UTC);
        assert_eq!(
            to_datetime(&to_asn1_time(past_2050).unwrap()).unwrap(),
            past_2050
        );
    }

    #[test]
    fn renewal_window() {
        let ca = short_lived(Duration::days(10));
        let policy = RenewalPolicy {
            validity: Duration::days(365),
            slack: Duration::days(7),
            key_bit_size: 2048,
        };
        let now = OffsetDateTime::now_utc();
        assert!(!policy.needs_renewal_at(ca.certificate(), now).unwrap());
        assert!(policy
            .needs_renewal_at(ca.certificate(), now + Duration::days(4))
            .unwrap());
        // Long expired certificates stay renewable
        assert!(policy
            .needs_renewal_at(ca.certificate(), now + Duration::days(400))
            .unwrap());
    }

    #[test]
    fn renewal_on_exact_slack_boundary() {
        let ca = short_lived(Duration::days(10));
        let not_after = not_after(ca.certificate()).unwrap();
        let policy = RenewalPolicy {
            validity: Duration::days(365),
            slack: Duration::days(7),
            key_bit_size: 2048,
        };
        assert!(policy
            .needs_renewal_at(ca.certificate(), not_after - Duration::days(7))
            .unwrap());
        assert!(!policy
            .needs_renewal_at(
                ca.certificate(),
                not_after - Duration::days(7) - Duration::seconds(1)
            )
            .unwrap());
    }

    #[test]
    fn slack_ratio_is_a_fraction_of_validity() {
        let policy = RenewalPolicy::with_slack_ratio(Duration::days(100), 0.25, 2048);
        assert_eq!(policy.slack, Duration::days(25));
        assert_eq!(RenewalPolicy::default().validity, Duration::days(365));
        assert_eq!(
            RenewalPolicy::with_slack_ratio(Duration::days(100), f64::NAN, 2048).slack,
            Duration::ZERO
        );
    }

    #[test]
    fn retain_unexpired_drops_old_and_duplicate_cas() {
        let fresh = short_lived(Duration::days(10));
        let stale = short_lived(Duration::days(1));
        let later = OffsetDateTime::now_utc() + Duration::days(2);
        let kept = retain_unexpired(
            [
                fresh.certificate().clone(),
                stale.certificate().clone(),
                fresh.certificate().clone(),
            ],
            later,
        )
        .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(
            kept[0].to_der().unwrap(),
            fresh.certificate().to_der().unwrap()
        );
    }
}
