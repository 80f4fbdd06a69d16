//! Throwaway certificates for tests.

use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{extension::BasicConstraints, X509Builder, X509Name, X509NameBuilder, X509NameRef, X509},
};

use crate::{credentials::CredentialSource, utils::Unloggable};

fn name(common_name: &str) -> X509Name {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .unwrap();
    name.build()
}

fn build(
    subject: &X509NameRef,
    issuer: &X509NameRef,
    key: &PKey<Private>,
    signing_key: &PKey<Private>,
    ca: bool,
) -> X509 {
    let mut x509 = X509Builder::new().unwrap();
    x509.set_version(3 - 1).unwrap();
    x509.set_subject_name(subject).unwrap();
    x509.set_issuer_name(issuer).unwrap();
    x509.set_not_before(Asn1Time::days_from_now(0).unwrap().as_ref())
        .unwrap();
    x509.set_not_after(Asn1Time::days_from_now(30).unwrap().as_ref())
        .unwrap();
    x509.set_pubkey(key).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    x509.set_serial_number(Asn1Integer::from_bn(&serial).unwrap().as_ref())
        .unwrap();
    if ca {
        x509.append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
    }
    x509.sign(signing_key, MessageDigest::sha256()).unwrap();
    x509.build()
}

fn generate_key() -> PKey<Private> {
    Rsa::generate(2048).and_then(PKey::try_from).unwrap()
}

pub fn generate_ca(common_name: &str) -> (X509, PKey<Private>) {
    let key = generate_key();
    let subject = name(common_name);
    (build(&subject, &subject, &key, &key, true), key)
}

pub fn generate_leaf(common_name: &str, ca: &X509, ca_key: &PKey<Private>) -> (X509, PKey<Private>) {
    let key = generate_key();
    let cert = build(&name(common_name), ca.subject_name(), &key, ca_key, false);
    (cert, key)
}

/// A complete, valid set of credentials as the Strimzi operators would issue them.
pub fn generate_credentials(common_name: &str) -> CredentialSource {
    let (ca, ca_key) = generate_ca("cluster-ca");
    let (cert, key) = generate_leaf(common_name, &ca, &ca_key);
    CredentialSource {
        client_cert_pem: cert.to_pem().unwrap(),
        client_key_pem: Unloggable(key.private_key_to_pem_pkcs8().unwrap()),
        ca_cert_pem: ca.to_pem().unwrap(),
    }
}
