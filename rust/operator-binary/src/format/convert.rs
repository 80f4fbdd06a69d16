use openssl::{error::ErrorStack as OpensslError, pkey::PKey, x509::X509};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use super::{
    pkcs12,
    well_known::{StorePasswords, TlsPkcs12, KEYSTORE_ALIAS, TRUSTSTORE_ALIAS},
};
use crate::{credentials::CredentialSource, utils::Unloggable};

/// Converts the PEM credentials into a keystore holding the client identity and a
/// truststore holding every CA certificate of the cluster.
///
/// The output only depends on `source` and `passwords`, so converting the same
/// credentials twice yields identical bytes.
pub fn convert_tls_to_pkcs12(
    source: &CredentialSource,
    passwords: &StorePasswords,
) -> Result<TlsPkcs12, TlsToPkcs12Error> {
    use tls_to_pkcs12_error::*;
    // user.crt may carry intermediates after the leaf, only the leaf goes into the key entry
    let cert = X509::stack_from_pem(&source.client_cert_pem)
        .context(LoadCertSnafu)?
        .into_iter()
        .next()
        .context(NoCertSnafu)?;
    let key = PKey::private_key_from_pem(&source.client_key_pem).context(LoadKeySnafu)?;
    let cert_key = cert.public_key().context(LoadCertSnafu)?;
    ensure!(cert_key.public_eq(&key), KeyMismatchSnafu);

    let ca_certs = X509::stack_from_pem(&source.ca_cert_pem).context(LoadCaSnafu)?;
    ensure!(!ca_certs.is_empty(), NoCaSnafu);
    let ca_ders = ca_certs
        .iter()
        .map(|ca| ca.to_der())
        .collect::<Result<Vec<_>, _>>()
        .context(SerializeCaSnafu)?;

    let cert_der = cert.to_der().context(SerializeCertSnafu)?;
    let key_der = Unloggable(key.private_key_to_pkcs8().context(SerializeKeySnafu)?);

    Ok(TlsPkcs12 {
        keystore: Unloggable(
            pkcs12::keystore(&cert_der, &key_der, KEYSTORE_ALIAS, &passwords.keystore)
                .context(BuildKeystoreSnafu)?,
        ),
        truststore: pkcs12::truststore(&ca_ders, TRUSTSTORE_ALIAS, &passwords.truststore)
            .context(BuildTruststoreSnafu)?,
    })
}

#[derive(Snafu, Debug)]
#[snafu(module)]
pub enum TlsToPkcs12Error {
    #[snafu(display("failed to load client certificate"))]
    LoadCert { source: OpensslError },

    #[snafu(display("client certificate PEM contains no certificate"))]
    NoCert,

    #[snafu(display("failed to load client private key"))]
    LoadKey { source: OpensslError },

    #[snafu(display("client private key does not belong to the client certificate"))]
    KeyMismatch,

    #[snafu(display("failed to load CA certificate"))]
    LoadCa { source: OpensslError },

    #[snafu(display("CA certificate PEM contains no certificate"))]
    NoCa,

    #[snafu(display("failed to serialize client certificate for keystore"))]
    SerializeCert { source: OpensslError },

    #[snafu(display("failed to serialize client private key for keystore"))]
    SerializeKey { source: OpensslError },

    #[snafu(display("failed to serialize CA certificate for truststore"))]
    SerializeCa { source: OpensslError },

    #[snafu(display("failed to build keystore"))]
    BuildKeystore { source: OpensslError },

    #[snafu(display("failed to build truststore"))]
    BuildTruststore { source: OpensslError },
}

impl TlsToPkcs12Error {
    /// Whether the credentials were well-formed but do not fit together.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, TlsToPkcs12Error::KeyMismatch)
    }
}
