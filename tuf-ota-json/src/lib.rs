//! JSON data model of the TUF metadata files used by tuf-ota.
//!
//! Every document is a [Signed] envelope around one of [root::Root], [timestamp::Timestamp],
//! [snapshot::Snapshot] or [targets::Targets]. Signatures are computed over the
//! [OLPC canonical JSON](http://wiki.laptop.org/go/Canonical_JSON) encoding of the `signed`
//! member. Keys are stored as DER encoded SubjectPublicKeyInfo, the key ID is the SHA-256
//! fingerprint of that encoding.
use core::fmt;
use core::str::FromStr;
use olpc_cjson::CanonicalFormatter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{hex::Hex, serde_as};
use spki::SubjectPublicKeyInfoRef;
use der::Decode;
use tuf_ota_common::crypto::sign::{Cipher, SigningKey};
use tuf_ota_common::{RoleType, TufError};

pub mod root;
pub mod snapshot;
pub mod targets;
pub mod timestamp;

/// Version of the TUF specification the documents follow.
pub const SPEC_VERSION: &str = "1.0.31";

/// Encodes `value` as canonical JSON.
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, TufError> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
    value
        .serialize(&mut ser)
        .map_err(|e| TufError::EncodingError(e.to_string()))?;
    Ok(buf)
}

/// SHA-256 digest of the canonical form of a public key.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(#[serde_as(as = "Hex")] pub [u8; 32]);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for KeyId {
    type Err = TufError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| TufError::DecodingError(format!("invalid key id `{s}`: {e}")))?;
        Ok(KeyId(out))
    }
}

/// A signature and the ID of the key that claims to have made it.
///
/// Both fields are kept as received so that a malformed entry only invalidates itself and not
/// the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: String,
    pub sig: String,
}

impl Signature {
    pub fn key_id(&self) -> Option<KeyId> {
        self.keyid.parse().ok()
    }

    pub fn raw_sig(&self) -> Option<Vec<u8>> {
        hex::decode(&self.sig).ok()
    }
}

/// Public key as listed in root metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub keytype: String,
    pub scheme: String,
    pub keyval: KeyVal,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVal {
    /// DER encoded SubjectPublicKeyInfo.
    #[serde_as(as = "Hex")]
    pub public: Vec<u8>,
}

impl Key {
    pub fn from_signing_key(key: &SigningKey) -> Result<Self, TufError> {
        let keytype = match key.cipher() {
            Cipher::Ed25519Dalek => "ed25519",
            Cipher::Ecdsa => "ecdsa",
        };
        Ok(Key {
            keytype: keytype.to_string(),
            scheme: key.scheme().to_string(),
            keyval: KeyVal {
                public: key.public_key_der()?,
            },
        })
    }

    /// Key hashes are calculated from the DER encoded SPKI.
    pub fn key_id(&self) -> Result<KeyId, TufError> {
        let spki = SubjectPublicKeyInfoRef::from_der(&self.keyval.public)
            .map_err(|_| TufError::DecodingPublicKeyFailed)?;
        spki.fingerprint_bytes()
            .map(KeyId)
            .map_err(|e| TufError::EncodingError(e.to_string()))
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<(), TufError> {
        let spki = SubjectPublicKeyInfoRef::from_der(&self.keyval.public)
            .map_err(|_| TufError::DecodingPublicKeyFailed)?;
        verify(&spki, msg, sig)
    }
}

/// Verifies `sig` over `msg` with the key in `spki`, dispatching on the key algorithm OID.
pub fn verify(spki: &SubjectPublicKeyInfoRef<'_>, msg: &[u8], sig: &[u8]) -> Result<(), TufError> {
    use ::signature::Verifier;
    let bad_signature = |_| TufError::BadSignature {
        key_id: spki
            .fingerprint_bytes()
            .map(hex::encode)
            .unwrap_or_default(),
    };
    match spki.algorithm.oid {
        const_oid::db::rfc8410::ID_ED_25519 => {
            let key = ed25519_dalek::VerifyingKey::try_from(spki.clone())
                .map_err(|_| TufError::DecodingPublicKeyFailed)?;
            let sig = ed25519_dalek::Signature::from_slice(sig)
                .map_err(|_| TufError::DecodingSignatureFailed)?;
            key.verify(msg, &sig).map_err(bad_signature)
        }
        const_oid::db::rfc5912::ID_EC_PUBLIC_KEY => {
            let key = p256::ecdsa::VerifyingKey::try_from(spki.clone())
                .map_err(|_| TufError::DecodingPublicKeyFailed)?;
            let sig = p256::ecdsa::Signature::from_slice(sig)
                .map_err(|_| TufError::DecodingSignatureFailed)?;
            key.verify(msg, &sig).map_err(bad_signature)
        }
        oid => Err(TufError::UnsupportedKeyAlgorithm(oid.to_string())),
    }
}

/// A signed TUF file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signed<T> {
    pub signatures: Vec<Signature>,
    pub signed: T,
    /// Canonical encoding of `signed` as it was signed or received.
    #[serde(skip)]
    canonical: Vec<u8>,
}

#[derive(Deserialize)]
struct RawSigned {
    signatures: Vec<Signature>,
    signed: Value,
}

impl<T: Serialize> Signed<T> {
    /// Creates a signed object using the given signing keys from the data in `signed`.
    pub fn from_signed(signed: T, signing_keys: &[SigningKey]) -> Result<Signed<T>, TufError> {
        let canonical = canonicalize(&signed)?;
        let signatures = signing_keys
            .iter()
            .map(|key| {
                let sig = key.sign(&canonical)?;
                Ok(Signature {
                    keyid: hex::encode(key.key_id()?),
                    sig: hex::encode(sig.to_vec()),
                })
            })
            .collect::<Result<Vec<_>, TufError>>()?;
        Ok(Signed {
            signatures,
            signed,
            canonical,
        })
    }

    /// The file as it is written to disk or served, in canonical form.
    pub fn to_json(&self) -> Result<Vec<u8>, TufError> {
        canonicalize(self)
    }
}

impl<T> Signed<T> {
    /// The bytes that the signatures are made over.
    pub fn canonical_signed(&self) -> &[u8] {
        &self.canonical
    }
}

impl<T: DeserializeOwned> Signed<T> {
    /// Decodes a file and checks that its `_type` matches `expected` before interpreting it.
    pub fn from_json(input: &[u8], expected: RoleType) -> Result<Signed<T>, TufError> {
        let raw: RawSigned =
            serde_json::from_slice(input).map_err(|e| TufError::DecodingError(e.to_string()))?;
        let found = raw
            .signed
            .get("_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if found != expected.as_str() {
            return Err(TufError::RoleMismatch {
                expected,
                found: found.to_string(),
            });
        }
        let canonical = canonicalize(&raw.signed)?;
        let signed = serde_json::from_value(raw.signed)
            .map_err(|e| TufError::DecodingError(format!("{expected}: {e}")))?;
        Ok(Signed {
            signatures: raw.signatures,
            signed,
            canonical,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{canonicalize, Key, KeyId, Signed};
    use crate::timestamp::Timestamp;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use tuf_ota_common::crypto::sign::{Cipher, SigningKey};
    use tuf_ota_common::{RoleType, TufError};

    fn timestamp() -> Timestamp {
        Timestamp {
            spec_version: crate::SPEC_VERSION.to_string(),
            version: 3,
            expires: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            meta: BTreeMap::new(),
        }
    }

    #[test]
    fn test_key_hash() {
        let signing_key = SigningKey::new(Cipher::Ed25519Dalek);
        let key = Key::from_signing_key(&signing_key).unwrap();
        assert_eq!(key.key_id().unwrap().0, signing_key.key_id().unwrap());
        assert_eq!(key.keytype, "ed25519");
    }

    #[test]
    fn test_key_id_hex() {
        let id = KeyId([0xab; 32]);
        let encoded = id.to_string();
        assert_eq!(encoded.len(), 64);
        assert_eq!(encoded.parse::<KeyId>().unwrap(), id);
        assert!("abcd".parse::<KeyId>().is_err());
    }

    #[test]
    fn test_canonical_form_sorted() {
        let mut map = BTreeMap::new();
        map.insert("b", 1);
        map.insert("a", 2);
        assert_eq!(canonicalize(&map).unwrap(), br#"{"a":2,"b":1}"#.to_vec());
    }

    /// Tests if the signed bytes survive encoding and decoding unchanged.
    #[test]
    fn test_signatures_verify_after_decoding() {
        for cipher in [Cipher::Ed25519Dalek, Cipher::Ecdsa] {
            let signing_key = SigningKey::new(cipher);
            let key = Key::from_signing_key(&signing_key).unwrap();
            let signed = Signed::from_signed(timestamp(), &[signing_key]).unwrap();
            let encoded = signed.to_json().unwrap();
            let decoded =
                Signed::<Timestamp>::from_json(&encoded, RoleType::Timestamp).unwrap();
            assert_eq!(decoded.canonical_signed(), signed.canonical_signed());
            assert_eq!(decoded.signed, signed.signed);
            let sig = decoded.signatures[0].raw_sig().unwrap();
            key.verify(decoded.canonical_signed(), &sig)
                .expect("failed to verify");
            key.verify(b"something else", &sig)
                .expect_err("expected failure");
        }
    }

    #[test]
    fn test_role_mismatch() {
        let signing_key = SigningKey::new(Cipher::Ed25519Dalek);
        let encoded = Signed::from_signed(timestamp(), &[signing_key])
            .unwrap()
            .to_json()
            .unwrap();
        let err = Signed::<Timestamp>::from_json(&encoded, RoleType::Snapshot)
            .expect_err("expected failure");
        assert_eq!(
            err,
            TufError::RoleMismatch {
                expected: RoleType::Snapshot,
                found: "timestamp".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_signature_does_not_break_decoding() {
        let signing_key = SigningKey::new(Cipher::Ed25519Dalek);
        let mut signed = Signed::from_signed(timestamp(), &[signing_key]).unwrap();
        signed.signatures[0].sig = "not hex".to_string();
        let encoded = signed.to_json().unwrap();
        let decoded = Signed::<Timestamp>::from_json(&encoded, RoleType::Timestamp).unwrap();
        assert!(decoded.signatures[0].raw_sig().is_none());
        assert!(decoded.signatures[0].key_id().is_some());
    }

    #[test]
    fn test_garbage_rejected() {
        let err = Signed::<Timestamp>::from_json(b"{\"signed\":", RoleType::Timestamp)
            .expect_err("expected failure");
        assert!(matches!(err, TufError::DecodingError(_)));
    }
}
