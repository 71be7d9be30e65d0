//! Diffie-Hellman key agreement for establishing associations over plain HTTP.
//!
//! Both parties pick a private exponent and exchange their public values. The provider then
//! hashes the shared secret and XORs the hash with the association secret, so only the masked
//! secret crosses the wire. The relying party recomputes the same hash and removes the mask.
//!
//! The hash is chosen by the session type and must be exactly as long as the association secret,
//! which ties `DH-SHA1` to `HMAC-SHA1` and `DH-SHA256` to `HMAC-SHA256`.
use std::fmt;

use base64::{decode, encode};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::association::AssociationKind;
use super::generator::RandomGenerator;
use crate::channel::error::ProtocolError;

/// The 1024 bit safe prime used when the relying party does not send its own modulus.
const DEFAULT_MODULUS_HEX: &[u8] = b"\
    DCF93A0B883972EC0E19989AC5A2CE310E1D37717E8D9571BB7623731866E61E\
    F75A2E27898B057F9891C2E27A639C3F29B60814581CD3B2CA3986D268370557\
    7D45C2E7E52DC81C7A171876E5CEA74B1448BFDFAF18828EFD2519F14E45E382\
    6634AF1949E5B535CC829A483B8A76223E5D490A257F05BDFF16F2FB22C583AB";

/// The generator used with the default modulus.
pub const DEFAULT_GENERATOR: u32 = 2;

static DEFAULT_MODULUS: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(DEFAULT_MODULUS_HEX, 16).unwrap_or_default());

/// The default modulus.
pub fn default_modulus() -> &'static BigUint {
    &DEFAULT_MODULUS
}

/// How the association secret is protected in an associate response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// The secret is sent in the clear. Only acceptable over an encrypted transport.
    NoEncryption,

    /// The secret is masked with the SHA-1 hash of the shared secret.
    DhSha1,

    /// The secret is masked with the SHA-256 hash of the shared secret.
    DhSha256,
}

impl SessionKind {
    /// The `session_type` wire name.
    pub fn name(self) -> &'static str {
        match self {
            SessionKind::NoEncryption => "no-encryption",
            SessionKind::DhSha1 => "DH-SHA1",
            SessionKind::DhSha256 => "DH-SHA256",
        }
    }

    /// Look up a session type by its wire name.
    pub fn from_name(name: &str) -> Result<Self, ProtocolError> {
        match name {
            "no-encryption" => Ok(SessionKind::NoEncryption),
            "DH-SHA1" => Ok(SessionKind::DhSha1),
            "DH-SHA256" => Ok(SessionKind::DhSha256),
            other => Err(ProtocolError::UnsupportedSessionType(other.to_string())),
        }
    }

    /// The Diffie-Hellman session that can carry a secret of this association kind.
    pub fn for_association(kind: AssociationKind) -> SessionKind {
        match kind {
            AssociationKind::HmacSha1 => SessionKind::DhSha1,
            AssociationKind::HmacSha256 => SessionKind::DhSha256,
        }
    }

    /// Whether a secret of the association kind can be transmitted in this session.
    ///
    /// An unencrypted session carries any secret. A Diffie-Hellman session needs a hash that is
    /// exactly as long as the secret.
    pub fn is_compatible(self, kind: AssociationKind) -> bool {
        match self.hash_len() {
            None => true,
            Some(len) => len == kind.secret_len(),
        }
    }

    /// Whether the session uses Diffie-Hellman at all.
    pub fn is_diffie_hellman(self) -> bool {
        self != SessionKind::NoEncryption
    }

    fn hash_len(self) -> Option<usize> {
        match self {
            SessionKind::NoEncryption => None,
            SessionKind::DhSha1 => Some(20),
            SessionKind::DhSha256 => Some(32),
        }
    }

    fn digest(self, data: &[u8]) -> Option<Vec<u8>> {
        match self {
            SessionKind::NoEncryption => None,
            SessionKind::DhSha1 => Some(Sha1::digest(data).to_vec()),
            SessionKind::DhSha256 => Some(Sha256::digest(data).to_vec()),
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One side of a key agreement.
///
/// Holds the private exponent, so it must not outlive the exchange it was created for.
#[derive(Clone)]
pub struct DiffieHellman {
    modulus: BigUint,
    generator: BigUint,
    private: BigUint,
    public: BigUint,
}

impl DiffieHellman {
    /// A fresh key pair over the default parameters.
    pub fn new(random: &RandomGenerator) -> Self {
        let modulus = default_modulus().clone();
        let generator = BigUint::from(DEFAULT_GENERATOR);
        DiffieHellman::generate(modulus, generator, random)
    }

    /// A fresh key pair over parameters chosen by the other party.
    pub fn with_parameters(
        modulus: BigUint, generator: BigUint, random: &RandomGenerator,
    ) -> Result<Self, ProtocolError> {
        let one = BigUint::from(1u32);
        if modulus <= BigUint::from(3u32) || !modulus.bit(0) {
            return Err(ProtocolError::InvalidFieldValue {
                field: "openid.dh_modulus".into(),
                reason: "not an odd modulus".into(),
            });
        }

        if generator <= one || generator >= modulus {
            return Err(ProtocolError::InvalidFieldValue {
                field: "openid.dh_gen".into(),
                reason: "generator out of range".into(),
            });
        }

        Ok(DiffieHellman::generate(modulus, generator, random))
    }

    fn generate(modulus: BigUint, generator: BigUint, random: &RandomGenerator) -> Self {
        // Private exponent uniformly enough in [1, p - 2].
        let bound = &modulus - BigUint::from(2u32);
        let bytes = random.bytes((modulus.bits() as usize + 7) / 8 + 8);
        let private = BigUint::from_bytes_be(&bytes) % &bound + BigUint::from(1u32);
        let public = generator.modpow(&private, &modulus);

        DiffieHellman {
            modulus,
            generator,
            private,
            public,
        }
    }

    /// The modulus of the group.
    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// The generator of the group.
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// The public value sent to the other party.
    pub fn public_key(&self) -> &BigUint {
        &self.public
    }

    /// Whether the default parameters are used, which need not be transmitted.
    pub fn uses_default_parameters(&self) -> bool {
        &self.modulus == default_modulus() && self.generator == BigUint::from(DEFAULT_GENERATOR)
    }

    /// The shared secret given the public value of the other party.
    pub fn shared_secret(&self, other_public: &BigUint) -> Result<BigUint, ProtocolError> {
        let one = BigUint::from(1u32);
        if other_public <= &one || other_public >= &(&self.modulus - &one) {
            return Err(ProtocolError::InvalidFieldValue {
                field: "public key".into(),
                reason: "Diffie-Hellman public value out of range".into(),
            });
        }

        Ok(other_public.modpow(&self.private, &self.modulus))
    }

    /// Mask or unmask a secret with the hash of the shared secret.
    ///
    /// The operation is its own inverse. The hash of the session must be as long as the secret.
    pub fn xor_secret(
        &self, session: SessionKind, other_public: &BigUint, secret: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let shared = self.shared_secret(other_public)?;
        let hash = session
            .digest(&btwoc(&shared))
            .ok_or_else(|| ProtocolError::UnsupportedSessionType(session.name().to_string()))?;

        if hash.len() != secret.len() {
            return Err(ProtocolError::SecretLengthMismatch {
                expected: hash.len(),
                actual: secret.len(),
            });
        }

        Ok(hash.iter().zip(secret).map(|(h, s)| h ^ s).collect())
    }
}

impl fmt::Debug for DiffieHellman {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DiffieHellman")
            .field("modulus_bits", &self.modulus.bits())
            .field("generator", &self.generator)
            .field("public", &self.public)
            .finish()
    }
}

/// The big-endian two's complement representation of a non-negative integer.
///
/// A leading zero byte is added whenever the highest bit would otherwise be set.
pub fn btwoc(value: &BigUint) -> Vec<u8> {
    let mut bytes = value.to_bytes_be();
    if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0);
    }
    bytes
}

/// Read a big-endian two's complement representation of a non-negative integer.
pub fn from_btwoc(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// The base64 encoded two's complement form used on the wire.
pub fn encode_number(value: &BigUint) -> String {
    encode(&btwoc(value))
}

/// Parse a base64 encoded two's complement number from the wire.
pub fn decode_number(field: &str, value: &str) -> Result<BigUint, ProtocolError> {
    let bytes = decode(value).map_err(|_| ProtocolError::InvalidFieldValue {
        field: field.to_string(),
        reason: "not base64".into(),
    })?;

    if bytes.is_empty() {
        return Err(ProtocolError::InvalidFieldValue {
            field: field.to_string(),
            reason: "empty number".into(),
        });
    }

    Ok(from_btwoc(&bytes))
}
