use openssl::{
    pkcs12::Pkcs12,
    pkey::{PKey, PKeyRef, Private},
    stack::Stack,
    x509::{X509Ref, X509},
};
use snafu::{OptionExt, ResultExt};

use super::{invalid_bundle_error, EncodingFailedSnafu, Result};

/// The contents of a password-less PKCS#12 keystore.
pub struct DecodedKeystore {
    pub private_key: PKey<Private>,
    pub certificate: X509,
    pub ca_chain: Vec<X509>,
}

/// Packs a key, its certificate and any extra CA certificates into a password-less
/// PKCS#12 keystore.
pub fn encode_keystore(
    private_key: &PKeyRef<Private>,
    certificate: &X509Ref,
    extra_cas: &[X509],
) -> Result<Vec<u8>> {
    let mut builder = Pkcs12::builder();
    if !extra_cas.is_empty() {
        let mut ca_stack = Stack::<X509>::new().context(EncodingFailedSnafu {
            what: "keystore CA chain",
        })?;
        for ca in extra_cas {
            ca_stack.push(ca.clone()).context(EncodingFailedSnafu {
                what: "keystore CA chain",
            })?;
        }
        builder.ca(ca_stack);
    }
    builder
        .cert(certificate)
        .pkey(private_key)
        .build2("")
        .and_then(|store| store.to_der())
        .context(EncodingFailedSnafu { what: "keystore" })
}

pub fn decode_keystore(der: &[u8]) -> Result<DecodedKeystore> {
    use invalid_bundle_error::*;
    let parsed = Pkcs12::from_der(der)
        .and_then(|store| store.parse2(""))
        .context(LoadFieldSnafu { field: "keystore" })?;
    Ok(DecodedKeystore {
        private_key: parsed.pkey.context(MissingFieldSnafu {
            field: "keystore private key",
        })?,
        certificate: parsed.cert.context(MissingFieldSnafu {
            field: "keystore certificate",
        })?,
        ca_chain: parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default(),
    })
}
