use std::collections::BTreeMap;

use rand::{distributions::Alphanumeric, Rng as _};
use stackable_operator::k8s_openapi::{api::core::v1::Secret, ByteString};

use crate::utils::Unloggable;

pub const FILE_PKCS12_KEYSTORE: &str = "keystore.p12";
pub const FILE_PKCS12_TRUSTSTORE: &str = "truststore.p12";
pub const KEY_KEYSTORE_PASSWORD: &str = "keystore_password";
pub const KEY_TRUSTSTORE_PASSWORD: &str = "truststore_password";

/// Alias of the private key entry in the keystore.
pub const KEYSTORE_ALIAS: &str = "confluent-schema-registry";
/// Alias of the first trusted CA entry in the truststore.
pub const TRUSTSTORE_ALIAS: &str = "caroot";

/// The `KeyStore` type name that Java needs to open the stores.
pub const STORE_TYPE: &str = "PKCS12";

const PASSWORD_LENGTH: usize = 24;

pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorePasswords {
    pub keystore: Unloggable<String>,
    pub truststore: Unloggable<String>,
}

impl StorePasswords {
    pub fn generate(mut generate_password: impl FnMut() -> String) -> Self {
        Self {
            keystore: Unloggable(generate_password()),
            truststore: Unloggable(generate_password()),
        }
    }

    /// Recovers the passwords stored in a previously written managed Secret.
    ///
    /// Returns [`None`] unless both passwords are present, so that a damaged Secret gets
    /// a fresh pair rather than a mix of old and new.
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let password = |key: &str| {
            data.get(key)
                .and_then(|value| String::from_utf8(value.0.clone()).ok())
                .filter(|value| !value.is_empty())
        };
        Some(Self {
            keystore: Unloggable(password(KEY_KEYSTORE_PASSWORD)?),
            truststore: Unloggable(password(KEY_TRUSTSTORE_PASSWORD)?),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsPkcs12 {
    pub keystore: Unloggable<Vec<u8>>,
    pub truststore: Vec<u8>,
}

impl TlsPkcs12 {
    /// Lays out the stores and their passwords as the data of the managed Secret.
    pub fn into_secret_data(self, passwords: &StorePasswords) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (FILE_PKCS12_KEYSTORE.to_string(), ByteString(self.keystore.0)),
            (FILE_PKCS12_TRUSTSTORE.to_string(), ByteString(self.truststore)),
            (
                KEY_KEYSTORE_PASSWORD.to_string(),
                ByteString(passwords.keystore.as_bytes().to_vec()),
            ),
            (
                KEY_TRUSTSTORE_PASSWORD.to_string(),
                ByteString(passwords.truststore.as_bytes().to_vec()),
            ),
        ])
    }
}
