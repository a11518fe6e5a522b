//! Minimal DER writer for an empty X.509 v1 certificate revocation list.
//!
//! OpenSSL's Rust bindings can parse CRLs but not build them, so the `TBSCertList` is
//! assembled by hand and signed with the CA key.

use openssl::{
    hash::MessageDigest,
    pkey::{PKeyRef, Private},
    sign::Signer,
    x509::{X509Crl, X509Ref},
};
use snafu::{OptionExt, ResultExt};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};
use yasna::{
    models::{GeneralizedTime, ObjectIdentifier, UTCTime},
    DERWriter,
};

use super::{EncodingFailedSnafu, InvalidCrlTimeSnafu, Result, SignatureFailedSnafu};

const SHA256_WITH_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 11];
const UTC_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year repr:last_two][month][day][hour][minute][second]Z");
const GENERALIZED_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]Z");

pub(super) fn build_empty_crl(
    ca_cert: &X509Ref,
    ca_key: &PKeyRef<Private>,
    this_update: OffsetDateTime,
    next_update: OffsetDateTime,
) -> Result<Vec<u8>> {
    let issuer = ca_cert
        .subject_name()
        .to_der()
        .context(EncodingFailedSnafu { what: "CRL issuer" })?;
    let this_update = CrlTime::new(this_update)?;
    let next_update = CrlTime::new(next_update)?;
    let tbs_cert_list = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            write_signature_algorithm(writer.next());
            writer.next().write_der(&issuer);
            this_update.write(writer.next());
            next_update.write(writer.next());
        });
    });

    let signature = Signer::new(MessageDigest::sha256(), ca_key)
        .and_then(|mut signer| {
            signer.update(&tbs_cert_list)?;
            signer.sign_to_vec()
        })
        .context(SignatureFailedSnafu { what: "CRL" })?;

    let der = yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_der(&tbs_cert_list);
            write_signature_algorithm(writer.next());
            writer
                .next()
                .write_bitvec_bytes(&signature, signature.len() * 8);
        });
    });
    X509Crl::from_der(&der)
        .and_then(|crl| crl.to_pem())
        .context(EncodingFailedSnafu { what: "CRL" })
}

fn write_signature_algorithm(writer: DERWriter) {
    writer.write_sequence(|writer| {
        writer
            .next()
            .write_oid(&ObjectIdentifier::from_slice(SHA256_WITH_RSA_ENCRYPTION));
        writer.next().write_null();
    });
}

/// `thisUpdate` and `nextUpdate` use UTCTime through 2049 and GeneralizedTime from 2050 on.
enum CrlTime {
    Utc(UTCTime),
    Generalized(GeneralizedTime),
}

impl CrlTime {
    fn new(datetime: OffsetDateTime) -> Result<Self> {
        let time = if (1950..2050).contains(&datetime.year()) {
            datetime
                .format(UTC_TIME_FORMAT)
                .ok()
                .and_then(|formatted| UTCTime::parse(formatted.as_bytes()))
                .map(CrlTime::Utc)
        } else {
            datetime
                .format(GENERALIZED_TIME_FORMAT)
                .ok()
                .and_then(|formatted| GeneralizedTime::parse(formatted.as_bytes()))
                .map(CrlTime::Generalized)
        };
        time.context(InvalidCrlTimeSnafu { datetime })
    }

    fn write(&self, writer: DERWriter) {
        match self {
            CrlTime::Utc(time) => writer.write_utctime(time),
            CrlTime::Generalized(time) => writer.write_generalized_time(time),
        }
    }
}

#[cfg(test)]
mod tests {
    use openssl::{pkey::PKey, rsa::Rsa, x509::X509Crl};
    use time::{macros::datetime, Duration};

    use super::*;
    use crate::pki::{CertificateAuthority, Purpose, RenewalPolicy};

    #[test]
    fn crl_is_parseable_and_signed() {
        let ca = CertificateAuthority::new_root(Purpose::Transport, &RenewalPolicy::default())
            .unwrap();
        let now = OffsetDateTime::now_utc();
        let pem = build_empty_crl(
            ca.certificate(),
            &ca.private_key,
            now,
            now + Duration::days(30),
        )
        .unwrap();
        let crl = X509Crl::from_pem(&pem).unwrap();
        assert!(crl.get_revoked().is_none());
        assert_eq!(
            crl.issuer_name().to_der().unwrap(),
            ca.certificate().subject_name().to_der().unwrap()
        );
        assert!(crl.verify(&ca.private_key).unwrap());

        let other = PKey::try_from(Rsa::generate(2048).unwrap()).unwrap();
        assert!(!crl.verify(&other).unwrap());
    }

    #[test]
    fn dates_from_2050_use_generalized_time() {
        assert!(matches!(
            CrlTime::new(datetime!(2049-12-31 23:59:59 UTC)).unwrap(),
            CrlTime::Utc(_)
        ));
        assert!(matches!(
            CrlTime::new(datetime!(2050-01-01 00:00:00 UTC)).unwrap(),
            CrlTime::Generalized(_)
        ));
    }

    #[test]
    fn long_lived_ca_gets_a_crl() {
        let policy = RenewalPolicy::with_slack_ratio(Duration::days(365 * 30), 0.1, 2048);
        let ca = CertificateAuthority::new_root(Purpose::Transport, &policy).unwrap();
        let bundle = ca.bundle().unwrap();
        let crl = X509Crl::from_pem(&bundle.crl).unwrap();
        assert!(crl.verify(&ca.private_key).unwrap());
        let next_update = crl.next_update().unwrap();
        let in_29_years = openssl::asn1::Asn1Time::days_from_now(365 * 29).unwrap();
        assert!(next_update > &*in_29_years);
        CertificateAuthority::load(Purpose::Transport, &bundle).unwrap();
    }
}
