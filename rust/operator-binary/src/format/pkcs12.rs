//! A small PKCS#12 (RFC 7292) writer that produces byte-for-byte reproducible
//! archives.
//!
//! OpenSSL's own PKCS#12 builder draws fresh random salts for every archive, which
//! would make every reconcile produce a different Secret. Here every salt is derived
//! from the password, a purpose label and the protected payload instead, so the same
//! inputs always yield the same bytes.

use openssl::{
    error::ErrorStack,
    hash::MessageDigest,
    pkey::PKey,
    sha::{sha1, Sha1, Sha256},
    sign::Signer,
    symm::{encrypt, Cipher},
};
use yasna::{models::ObjectIdentifier, DERWriter, Tag};

const ITERATIONS: u32 = 2048;
const SALT_LEN: usize = 8;

const OID_DATA_CONTENT_TYPE: &[u64] = &[1, 2, 840, 113549, 1, 7, 1];
const OID_ENCRYPTED_DATA_CONTENT_TYPE: &[u64] = &[1, 2, 840, 113549, 1, 7, 6];
const OID_FRIENDLY_NAME: &[u64] = &[1, 2, 840, 113549, 1, 9, 20];
const OID_LOCAL_KEY_ID: &[u64] = &[1, 2, 840, 113549, 1, 9, 21];
const OID_CERT_TYPE_X509_CERTIFICATE: &[u64] = &[1, 2, 840, 113549, 1, 9, 22, 1];
const OID_PBE_WITH_SHA_AND3_KEY_TRIPLE_DESCBC: &[u64] = &[1, 2, 840, 113549, 1, 12, 1, 3];
const OID_SHROUDED_KEY_BAG: &[u64] = &[1, 2, 840, 113549, 1, 12, 10, 1, 2];
const OID_CERT_BAG: &[u64] = &[1, 2, 840, 113549, 1, 12, 10, 1, 3];
const OID_SHA1: &[u64] = &[1, 3, 14, 3, 2, 26];
/// Oracle's marker for certificates that Java's `KeyStore` should load as trusted entries.
const OID_JAVA_TRUSTED_KEY_USAGE: &[u64] = &[2, 16, 840, 1, 113894, 746875, 1, 1];
const OID_ANY_EXTENDED_KEY_USAGE: &[u64] = &[2, 5, 29, 37, 0];

fn oid(components: &[u64]) -> ObjectIdentifier {
    ObjectIdentifier::from_slice(components)
}

/// Encodes `s` as a null-terminated big-endian UTF-16 string, the form PKCS#12 feeds
/// into its key derivation function.
pub fn bmp_string(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain([0])
        .flat_map(u16::to_be_bytes)
        .collect()
}

/// The password-based key derivation function from RFC 7292 appendix B.2, using SHA-1.
///
/// `id` selects the purpose: 1 for cipher keys, 2 for IVs, 3 for MAC keys.
fn pkcs12_kdf(password: &[u8], salt: &[u8], id: u8, size: usize) -> Vec<u8> {
    const V: usize = 64;
    fn fill(src: &[u8]) -> Vec<u8> {
        src.iter()
            .copied()
            .cycle()
            .take(V * src.len().div_ceil(V))
            .collect()
    }

    let diversifier = [id; V];
    let mut input = fill(salt);
    input.extend(fill(password));

    let mut out = Vec::with_capacity(size);
    loop {
        let mut hasher = Sha1::new();
        hasher.update(&diversifier);
        hasher.update(&input);
        let mut a = hasher.finish();
        for _ in 1..ITERATIONS {
            a = sha1(&a);
        }
        out.extend_from_slice(&a);
        if out.len() >= size {
            out.truncate(size);
            return out;
        }

        // I_j = (I_j + B + 1) mod 2^(8v), where B is A repeated to fill one block
        let b = a.iter().copied().cycle().take(V).collect::<Vec<u8>>();
        for block in input.chunks_mut(V) {
            let mut carry = 1u16;
            for (x, y) in block.iter_mut().rev().zip(b.iter().rev()) {
                let sum = u16::from(*x) + u16::from(*y) + carry;
                *x = sum as u8;
                carry = sum >> 8;
            }
        }
    }
}

struct Protector {
    password: Vec<u8>,
    raw_password: String,
}

impl Protector {
    fn new(password: &str) -> Self {
        Self {
            password: bmp_string(password),
            raw_password: password.to_string(),
        }
    }

    fn salt(&self, label: &str, payload: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.raw_password.as_bytes());
        hasher.update(&[0]);
        hasher.update(label.as_bytes());
        hasher.update(&[0]);
        hasher.update(payload);
        hasher.finish()[..SALT_LEN].to_vec()
    }

    fn encrypt(&self, salt: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let key = pkcs12_kdf(&self.password, salt, 1, 24);
        let iv = pkcs12_kdf(&self.password, salt, 2, 8);
        encrypt(Cipher::des_ede3_cbc(), &key, Some(&iv), data)
    }

    fn mac(&self, salt: &[u8], data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
        let key = PKey::hmac(&pkcs12_kdf(&self.password, salt, 3, 20))?;
        let mut signer = Signer::new(MessageDigest::sha1(), &key)?;
        signer.update(data)?;
        signer.sign_to_vec()
    }
}

enum Attribute {
    FriendlyName(String),
    LocalKeyId(Vec<u8>),
    JavaTrustedKeyUsage,
}

impl Attribute {
    fn write(&self, w: DERWriter) {
        w.write_sequence(|w| match self {
            Attribute::FriendlyName(name) => {
                w.next().write_oid(&oid(OID_FRIENDLY_NAME));
                w.next().write_set_of(|w| w.next().write_bmp_string(name));
            }
            Attribute::LocalKeyId(id) => {
                w.next().write_oid(&oid(OID_LOCAL_KEY_ID));
                w.next().write_set_of(|w| w.next().write_bytes(id));
            }
            Attribute::JavaTrustedKeyUsage => {
                w.next().write_oid(&oid(OID_JAVA_TRUSTED_KEY_USAGE));
                w.next()
                    .write_set_of(|w| w.next().write_oid(&oid(OID_ANY_EXTENDED_KEY_USAGE)));
            }
        })
    }
}

enum BagContent {
    Certificate { der: Vec<u8> },
    ShroudedKey { salt: Vec<u8>, encrypted: Vec<u8> },
}

struct SafeBag {
    content: BagContent,
    attributes: Vec<Attribute>,
}

impl SafeBag {
    fn write(&self, w: DERWriter) {
        w.write_sequence(|w| {
            match &self.content {
                BagContent::Certificate { der } => {
                    w.next().write_oid(&oid(OID_CERT_BAG));
                    w.next().write_tagged(Tag::context(0), |w| {
                        w.write_sequence(|w| {
                            w.next().write_oid(&oid(OID_CERT_TYPE_X509_CERTIFICATE));
                            w.next()
                                .write_tagged(Tag::context(0), |w| w.write_bytes(der));
                        })
                    });
                }
                BagContent::ShroudedKey { salt, encrypted } => {
                    w.next().write_oid(&oid(OID_SHROUDED_KEY_BAG));
                    w.next().write_tagged(Tag::context(0), |w| {
                        w.write_sequence(|w| {
                            write_pbe_algorithm(w.next(), salt);
                            w.next().write_bytes(encrypted);
                        })
                    });
                }
            }
            if !self.attributes.is_empty() {
                w.next().write_set_of(|w| {
                    for attr in &self.attributes {
                        attr.write(w.next());
                    }
                });
            }
        })
    }
}

fn write_pbe_algorithm(w: DERWriter, salt: &[u8]) {
    w.write_sequence(|w| {
        w.next().write_oid(&oid(OID_PBE_WITH_SHA_AND3_KEY_TRIPLE_DESCBC));
        w.next().write_sequence(|w| {
            w.next().write_bytes(salt);
            w.next().write_u32(ITERATIONS);
        });
    })
}

fn safe_contents_der(bags: &[SafeBag]) -> Vec<u8> {
    yasna::construct_der(|w| {
        w.write_sequence_of(|w| {
            for bag in bags {
                bag.write(w.next());
            }
        })
    })
}

enum ContentInfo {
    Data(Vec<u8>),
    EncryptedData { salt: Vec<u8>, encrypted: Vec<u8> },
}

impl ContentInfo {
    fn plain(bags: &[SafeBag]) -> Self {
        ContentInfo::Data(safe_contents_der(bags))
    }

    fn encrypted(protector: &Protector, label: &str, bags: &[SafeBag]) -> Result<Self, ErrorStack> {
        let contents = safe_contents_der(bags);
        let salt = protector.salt(label, &contents);
        let encrypted = protector.encrypt(&salt, &contents)?;
        Ok(ContentInfo::EncryptedData { salt, encrypted })
    }

    fn write(&self, w: DERWriter) {
        w.write_sequence(|w| match self {
            ContentInfo::Data(data) => {
                w.next().write_oid(&oid(OID_DATA_CONTENT_TYPE));
                w.next()
                    .write_tagged(Tag::context(0), |w| w.write_bytes(data));
            }
            ContentInfo::EncryptedData { salt, encrypted } => {
                w.next().write_oid(&oid(OID_ENCRYPTED_DATA_CONTENT_TYPE));
                w.next().write_tagged(Tag::context(0), |w| {
                    w.write_sequence(|w| {
                        // EncryptedData version
                        w.next().write_u8(0);
                        w.next().write_sequence(|w| {
                            w.next().write_oid(&oid(OID_DATA_CONTENT_TYPE));
                            write_pbe_algorithm(w.next(), salt);
                            w.next()
                                .write_tagged_implicit(Tag::context(0), |w| w.write_bytes(encrypted));
                        });
                    })
                });
            }
        })
    }
}

/// Wraps the given content infos into a MAC-protected PFX PDU.
fn pfx_der(protector: &Protector, contents: &[ContentInfo]) -> Result<Vec<u8>, ErrorStack> {
    let auth_safe = yasna::construct_der(|w| {
        w.write_sequence_of(|w| {
            for content in contents {
                content.write(w.next());
            }
        })
    });
    let mac_salt = protector.salt("mac", &auth_safe);
    let mac = protector.mac(&mac_salt, &auth_safe)?;
    Ok(yasna::construct_der(|w| {
        w.write_sequence(|w| {
            w.next().write_u8(3);
            ContentInfo::Data(auth_safe.clone()).write(w.next());
            w.next().write_sequence(|w| {
                w.next().write_sequence(|w| {
                    w.next().write_sequence(|w| {
                        w.next().write_oid(&oid(OID_SHA1));
                        w.next().write_null();
                    });
                    w.next().write_bytes(&mac);
                });
                w.next().write_bytes(&mac_salt);
                w.next().write_u32(ITERATIONS);
            });
        })
    }))
}

/// Builds a keystore holding a single private key entry.
///
/// `cert_der` is the DER encoded leaf certificate, `key_pkcs8_der` the matching
/// unencrypted PKCS#8 `PrivateKeyInfo`.
pub fn keystore(
    cert_der: &[u8],
    key_pkcs8_der: &[u8],
    alias: &str,
    password: &str,
) -> Result<Vec<u8>, ErrorStack> {
    let protector = Protector::new(password);
    let local_key_id = sha1(cert_der).to_vec();
    let attributes = || {
        vec![
            Attribute::FriendlyName(alias.to_string()),
            Attribute::LocalKeyId(local_key_id.clone()),
        ]
    };

    let key_salt = protector.salt("key", key_pkcs8_der);
    let key_bag = SafeBag {
        content: BagContent::ShroudedKey {
            encrypted: protector.encrypt(&key_salt, key_pkcs8_der)?,
            salt: key_salt,
        },
        attributes: attributes(),
    };
    let cert_bag = SafeBag {
        content: BagContent::Certificate {
            der: cert_der.to_vec(),
        },
        attributes: attributes(),
    };
    pfx_der(
        &protector,
        &[
            ContentInfo::encrypted(&protector, "certs", &[cert_bag])?,
            ContentInfo::plain(&[key_bag]),
        ],
    )
}

/// Builds a truststore holding one trusted certificate entry per item of `ca_ders`.
///
/// The first entry is named `alias`, subsequent ones `alias-1`, `alias-2` and so on.
pub fn truststore(ca_ders: &[Vec<u8>], alias: &str, password: &str) -> Result<Vec<u8>, ErrorStack> {
    let protector = Protector::new(password);
    let bags = ca_ders
        .iter()
        .enumerate()
        .map(|(i, der)| SafeBag {
            content: BagContent::Certificate { der: der.clone() },
            attributes: vec![
                Attribute::FriendlyName(if i == 0 {
                    alias.to_string()
                } else {
                    format!("{alias}-{i}")
                }),
                Attribute::JavaTrustedKeyUsage,
            ],
        })
        .collect::<Vec<_>>();
    pfx_der(
        &protector,
        &[ContentInfo::encrypted(&protector, "certs", &bags)?],
    )
}
