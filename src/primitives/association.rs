//! Associations are secrets shared between a relying party and a provider.
//!
//! An association is established once, either minted locally by a provider or reconstructed from
//! an associate response, and then signs every message exchanged until it expires. The secret
//! length is tied to the HMAC algorithm in use, and the expiration is fixed at creation.
//!
//! Storage of associations is trait based. The in-memory `AssociationMap` is sufficient for a
//! single process; a persistent or distributed store only needs to implement `AssociationStore`.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use base64::{decode, encode};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use super::generator::RandomGenerator;
use super::kvform::{self, Conformance};
use super::{from_unix, Time};
use crate::channel::error::ProtocolError;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// The only supported version tag of a serialized association.
const SERIALIZATION_VERSION: &str = "2";

/// The signature algorithm of an association.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// HMAC with SHA-1, a 20 byte secret.
    HmacSha1,

    /// HMAC with SHA-256, a 32 byte secret.
    HmacSha256,
}

impl AssociationKind {
    /// All supported kinds, strongest first.
    pub const ALL: [AssociationKind; 2] = [AssociationKind::HmacSha256, AssociationKind::HmacSha1];

    /// The `assoc_type` wire name.
    pub fn name(self) -> &'static str {
        match self {
            AssociationKind::HmacSha1 => "HMAC-SHA1",
            AssociationKind::HmacSha256 => "HMAC-SHA256",
        }
    }

    /// Look up a kind by its wire name.
    pub fn from_name(name: &str) -> Result<Self, ProtocolError> {
        AssociationKind::ALL
            .iter()
            .cloned()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| ProtocolError::UnsupportedAlgorithm(name.to_string()))
    }

    /// Required length of the secret in bytes.
    pub fn secret_len(self) -> usize {
        match self {
            AssociationKind::HmacSha1 => 20,
            AssociationKind::HmacSha256 => 32,
        }
    }

    /// Length of the produced signature in bits.
    pub fn hash_bits(self) -> usize {
        self.secret_len() * 8
    }

    /// Find the strongest kind whose hash length lies within the bounds.
    pub fn best(minimum_bits: usize, maximum_bits: usize) -> Option<AssociationKind> {
        AssociationKind::ALL
            .iter()
            .cloned()
            .find(|kind| kind.hash_bits() >= minimum_bits && kind.hash_bits() <= maximum_bits)
    }
}

impl fmt::Display for AssociationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AssociationKind {
    type Err = ProtocolError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        AssociationKind::from_name(name)
    }
}

/// A shared secret with an expiration.
#[derive(Clone, PartialEq, Eq)]
pub struct Association {
    handle: String,
    secret: Vec<u8>,
    issued: Time,
    lifetime: Duration,
    kind: AssociationKind,
}

impl Association {
    /// Construct an association from its parts.
    ///
    /// The issue date is truncated to the second, the precision in which it is stored.
    pub fn new<H: Into<String>>(
        kind: AssociationKind, handle: H, secret: Vec<u8>, issued: Time, lifetime: Duration,
    ) -> Result<Self, ProtocolError> {
        let handle = handle.into();
        if handle.is_empty() {
            return Err(ProtocolError::InvalidFieldValue {
                field: "handle".into(),
                reason: "association handle must not be empty".into(),
            });
        }

        if secret.len() != kind.secret_len() {
            return Err(ProtocolError::SecretLengthMismatch {
                expected: kind.secret_len(),
                actual: secret.len(),
            });
        }

        if lifetime <= Duration::zero() {
            return Err(ProtocolError::InvalidFieldValue {
                field: "lifetime".into(),
                reason: "association lifetime must be positive".into(),
            });
        }

        let issued = from_unix(issued.timestamp()).ok_or_else(|| ProtocolError::InvalidFieldValue {
            field: "issued".into(),
            reason: "issue date out of range".into(),
        })?;

        if issued.checked_add_signed(lifetime).is_none() {
            return Err(ProtocolError::InvalidFieldValue {
                field: "lifetime".into(),
                reason: "association would expire out of range".into(),
            });
        }

        Ok(Association {
            handle,
            secret,
            issued,
            lifetime,
            kind,
        })
    }

    /// Construct an association for an algorithm given by its wire name.
    pub fn create<H: Into<String>>(
        algorithm: &str, handle: H, secret: Vec<u8>, issued: Time, lifetime: Duration,
    ) -> Result<Self, ProtocolError> {
        let kind = AssociationKind::from_name(algorithm)?;
        Association::new(kind, handle, secret, issued, lifetime)
    }

    /// Mint a new association with a random secret and a unique handle, issued now.
    pub fn generate(kind: AssociationKind, lifetime: Duration, random: &RandomGenerator) -> Self {
        let issued = Utc::now();
        let handle = format!(
            "{{{}}}{{{:x}}}{{{}}}",
            kind.name(),
            issued.timestamp(),
            random.token(6)
        );

        Association {
            handle,
            secret: random.bytes(kind.secret_len()),
            issued: from_unix(issued.timestamp()).unwrap_or(issued),
            lifetime,
            kind,
        }
    }

    /// The opaque identifier of this association.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// The raw key bytes.
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// When the association was created.
    pub fn issued(&self) -> Time {
        self.issued
    }

    /// The total lifetime from issue to expiry.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// The signature algorithm.
    pub fn kind(&self) -> AssociationKind {
        self.kind
    }

    /// The point in time at which the association is no longer valid.
    pub fn expires(&self) -> Time {
        self.issued
            .checked_add_signed(self.lifetime)
            .unwrap_or(Time::MAX_UTC)
    }

    /// Whether the association has expired, evaluated now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the association has expired at `now`.
    pub fn is_expired_at(&self, now: Time) -> bool {
        now >= self.expires()
    }

    /// Whole seconds until expiration, never negative.
    pub fn seconds_till_expiration(&self, now: Time) -> i64 {
        (self.expires() - now).num_seconds().max(0)
    }

    /// Whether at least `minimum` of lifetime remains at `now`.
    ///
    /// An association that is about to expire should not be used to start an authentication
    /// that may take the user several minutes to complete.
    pub fn has_useful_life_remaining(&self, minimum: Duration, now: Time) -> bool {
        self.expires() - now >= minimum
    }

    /// Sign the ordered fields.
    ///
    /// The signature base string is the key-value form of the fields in the given order.
    /// Whitespace around keys and values is trimmed.
    pub fn sign<I, K, V>(&self, fields: I) -> Result<Vec<u8>, ProtocolError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let data = kvform::encode(fields, Conformance::Loose)?;
        Ok(self.sign_bytes(&data))
    }

    /// Sign raw data with the secret.
    pub fn sign_bytes(&self, data: &[u8]) -> Vec<u8> {
        match self.kind {
            AssociationKind::HmacSha1 => {
                let mut mac = HmacSha1::new_from_slice(&self.secret)
                    .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            AssociationKind::HmacSha256 => {
                let mut mac = HmacSha256::new_from_slice(&self.secret)
                    .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Recompute the signature over the ordered fields and compare it in constant time.
    ///
    /// Fields that can not be encoded never verify.
    pub fn verify<I, K, V>(&self, fields: I, signature: &[u8]) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        match kvform::encode(fields, Conformance::Loose) {
            Ok(data) => self.verify_bytes(&data, signature),
            Err(err) => {
                debug!("Signature base string could not be encoded: {}", err);
                false
            }
        }
    }

    /// Verify a signature over raw data in constant time.
    pub fn verify_bytes(&self, data: &[u8], signature: &[u8]) -> bool {
        match self.kind {
            AssociationKind::HmacSha1 => {
                let mut mac = HmacSha1::new_from_slice(&self.secret)
                    .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
            AssociationKind::HmacSha256 => {
                let mut mac = HmacSha256::new_from_slice(&self.secret)
                    .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
                mac.update(data);
                mac.verify_slice(signature).is_ok()
            }
        }
    }

    /// Store the association in the key-value form.
    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let issued = self.issued.timestamp().to_string();
        let expires_in = self.lifetime.num_seconds().to_string();
        let secret = encode(&self.secret);
        kvform::encode(
            vec![
                ("version", SERIALIZATION_VERSION),
                ("handle", self.handle.as_str()),
                ("secret", secret.as_str()),
                ("issued", issued.as_str()),
                ("expires_in", expires_in.as_str()),
                ("assoc_type", self.kind.name()),
            ],
            Conformance::Strict,
        )
    }

    /// Restore an association stored with `serialize`.
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        let map = kvform::decode_map(data, Conformance::Strict)?;
        let field = |name: &'static str| {
            map.get(name)
                .map(String::as_str)
                .ok_or_else(|| ProtocolError::MissingRequiredField {
                    message: "association",
                    field: name.into(),
                })
        };
        let invalid = |name: &'static str, reason: &str| ProtocolError::InvalidFieldValue {
            field: name.into(),
            reason: reason.into(),
        };

        let version = field("version")?;
        if version != SERIALIZATION_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version.to_string()));
        }

        let kind = AssociationKind::from_name(field("assoc_type")?)?;
        let secret = decode(field("secret")?).map_err(|_| invalid("secret", "not base64"))?;
        let issued = field("issued")?
            .parse::<i64>()
            .ok()
            .and_then(from_unix)
            .ok_or_else(|| invalid("issued", "not a unix timestamp"))?;
        let expires_in = field("expires_in")?
            .parse::<i64>()
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| invalid("expires_in", "not a number of seconds"))?;

        Association::new(kind, field("handle")?, secret, issued, expires_in)
    }
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Association")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("issued", &self.issued)
            .field("expires", &self.expires())
            .finish()
    }
}

/// Keeps associations, grouped by the party they are shared with.
///
/// The key distinguishes independent sets of associations: a relying party uses the provider
/// endpoint, a provider separates associations shared with smart relying parties from its
/// private ones. Implementations are shared between concurrent requests and must do their own
/// locking.
pub trait AssociationStore: Send + Sync {
    /// Add an association, replacing one with the same handle.
    fn store(&self, key: &str, association: Association) -> Result<(), ()>;

    /// Find an unexpired association.
    ///
    /// With a handle, only that association is returned. Without one, the association with the
    /// longest remaining lifetime is returned.
    fn get(&self, key: &str, handle: Option<&str>) -> Result<Option<Association>, ()>;

    /// Remove an association, returning whether it was present.
    fn remove(&self, key: &str, handle: &str) -> Result<bool, ()>;
}

/// An in-memory association store.
///
/// Expired associations are evicted lazily, whenever their key is accessed.
#[derive(Debug, Default)]
pub struct AssociationMap {
    inner: Mutex<HashMap<String, Vec<Association>>>,
}

impl AssociationMap {
    /// Create an empty store.
    pub fn new() -> Self {
        AssociationMap::default()
    }
}

impl AssociationStore for AssociationMap {
    fn store(&self, key: &str, association: Association) -> Result<(), ()> {
        let mut map = self.inner.lock().map_err(|_| ())?;
        let list = map.entry(key.to_string()).or_insert_with(Vec::new);
        list.retain(|existing| existing.handle != association.handle);
        list.push(association);
        Ok(())
    }

    fn get(&self, key: &str, handle: Option<&str>) -> Result<Option<Association>, ()> {
        let mut map = self.inner.lock().map_err(|_| ())?;
        let list = match map.get_mut(key) {
            Some(list) => list,
            None => return Ok(None),
        };

        let now = Utc::now();
        list.retain(|association| !association.is_expired_at(now));

        let found = match handle {
            Some(handle) => list.iter().find(|association| association.handle == handle),
            None => list.iter().max_by_key(|association| association.expires()),
        };

        Ok(found.cloned())
    }

    fn remove(&self, key: &str, handle: &str) -> Result<bool, ()> {
        let mut map = self.inner.lock().map_err(|_| ())?;
        let list = match map.get_mut(key) {
            Some(list) => list,
            None => return Ok(false),
        };

        let before = list.len();
        list.retain(|association| association.handle != handle);
        Ok(list.len() != before)
    }
}

impl<'a, S: AssociationStore + ?Sized> AssociationStore for &'a S {
    fn store(&self, key: &str, association: Association) -> Result<(), ()> {
        (**self).store(key, association)
    }

    fn get(&self, key: &str, handle: Option<&str>) -> Result<Option<Association>, ()> {
        (**self).get(key, handle)
    }

    fn remove(&self, key: &str, handle: &str) -> Result<bool, ()> {
        (**self).remove(key, handle)
    }
}

impl<S: AssociationStore + ?Sized> AssociationStore for Box<S> {
    fn store(&self, key: &str, association: Association) -> Result<(), ()> {
        (**self).store(key, association)
    }

    fn get(&self, key: &str, handle: Option<&str>) -> Result<Option<Association>, ()> {
        (**self).get(key, handle)
    }

    fn remove(&self, key: &str, handle: &str) -> Result<bool, ()> {
        (**self).remove(key, handle)
    }
}

impl<S: AssociationStore + ?Sized> AssociationStore for Arc<S> {
    fn store(&self, key: &str, association: Association) -> Result<(), ()> {
        (**self).store(key, association)
    }

    fn get(&self, key: &str, handle: Option<&str>) -> Result<Option<Association>, ()> {
        (**self).get(key, handle)
    }

    fn remove(&self, key: &str, handle: &str) -> Result<bool, ()> {
        (**self).remove(key, handle)
    }
}
