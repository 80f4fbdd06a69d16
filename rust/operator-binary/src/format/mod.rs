//! Conversion of PEM credentials into the password-protected stores that the Schema
//! Registry's Kafka client loads.

pub use self::{
    convert::{convert_tls_to_pkcs12, TlsToPkcs12Error},
    well_known::{StorePasswords, TlsPkcs12},
};

mod convert;
pub mod pkcs12;
pub mod well_known;

#[cfg(test)]
pub(crate) mod test_certs;
