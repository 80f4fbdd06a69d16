//! Reading the TLS material that the Strimzi operators issue for a registry, and
//! fingerprinting it so that rotations can be detected.

use std::fmt::Display;

use openssl::sha::Sha256;
use snafu::{OptionExt as _, Snafu};
use stackable_operator::{k8s_openapi::api::core::v1::Secret, kube::runtime::reflector::ObjectRef};

use crate::utils::{FmtByteSlice, Unloggable};

/// Key of the client certificate in the Secret written by the Strimzi user operator.
pub const CLIENT_CERT_KEY: &str = "user.crt";
/// Key of the client private key in the Secret written by the Strimzi user operator.
pub const CLIENT_KEY_KEY: &str = "user.key";
/// Key of the CA certificate(s) in the cluster CA Secret written by the Strimzi cluster operator.
pub const CA_CERT_KEY: &str = "ca.crt";

/// Annotation that records which credentials the managed objects were built from.
pub const CREDENTIAL_DIGEST_ANNOTATION: &str =
    "strimziregistryoperator.roundtable.lsst.codes/credentialDigest";

/// The KafkaUser for a registry shares its name, and so does the Secret holding its client certificate.
pub fn client_secret_name(registry_name: &str) -> String {
    registry_name.to_string()
}

pub fn cluster_ca_secret_name(cluster: &str) -> String {
    format!("{cluster}-cluster-ca-cert")
}

#[derive(Debug, Snafu)]
pub enum CredentialError {
    #[snafu(display("{secret} has not been issued yet"))]
    SecretNotFound { secret: ObjectRef<Secret> },

    #[snafu(display("{secret} has no {key:?} entry yet"))]
    KeyNotFound {
        secret: ObjectRef<Secret>,
        key: &'static str,
    },
}

impl CredentialError {
    pub fn secret(&self) -> &ObjectRef<Secret> {
        match self {
            CredentialError::SecretNotFound { secret } => secret,
            CredentialError::KeyNotFound { secret, .. } => secret,
        }
    }
}

/// The PEM material a registry needs to authenticate against its Kafka cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialSource {
    pub client_cert_pem: Vec<u8>,
    pub client_key_pem: Unloggable<Vec<u8>>,
    pub ca_cert_pem: Vec<u8>,
}

impl CredentialSource {
    /// Assembles the credentials from the (possibly not yet existing) client and cluster CA Secrets.
    pub fn from_secrets(
        client_secret: Result<&Secret, ObjectRef<Secret>>,
        ca_secret: Result<&Secret, ObjectRef<Secret>>,
    ) -> Result<Self, CredentialError> {
        let client_secret =
            client_secret.map_err(|secret| CredentialError::SecretNotFound { secret })?;
        let ca_secret = ca_secret.map_err(|secret| CredentialError::SecretNotFound { secret })?;
        Ok(Self {
            client_cert_pem: secret_entry(client_secret, CLIENT_CERT_KEY)?,
            client_key_pem: Unloggable(secret_entry(client_secret, CLIENT_KEY_KEY)?),
            ca_cert_pem: secret_entry(ca_secret, CA_CERT_KEY)?,
        })
    }

    pub fn digest(&self) -> CredentialDigest {
        CredentialDigest::of(&self.client_cert_pem, &self.client_key_pem, &self.ca_cert_pem)
    }
}

fn secret_entry(secret: &Secret, key: &'static str) -> Result<Vec<u8>, CredentialError> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.clone())
        .filter(|value| !value.is_empty())
        .context(KeyNotFoundSnafu {
            secret: ObjectRef::from_obj(secret),
            key,
        })
}

/// A fingerprint of a [`CredentialSource`], rendered as `sha256:<hex>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CredentialDigest(String);

impl CredentialDigest {
    /// Every input is prefixed by its length, so moving bytes from one input to the next
    /// always changes the digest.
    pub fn of(client_cert_pem: &[u8], client_key_pem: &[u8], ca_cert_pem: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        for input in [client_cert_pem, client_key_pem, ca_cert_pem] {
            hasher.update(&(input.len() as u64).to_be_bytes());
            hasher.update(input);
        }
        Self(format!("sha256:{:x}", FmtByteSlice(&hasher.finish())))
    }

    /// Reads the digest recorded on an object by a previous reconcile, if any.
    pub fn from_annotations(
        annotations: Option<&std::collections::BTreeMap<String, String>>,
    ) -> Option<Self> {
        annotations
            .and_then(|annotations| annotations.get(CREDENTIAL_DIGEST_ANNOTATION))
            .map(|digest| Self(digest.clone()))
    }
}

impl Display for CredentialDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
