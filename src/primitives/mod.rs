//! A collection of primitives shared by relying parties and providers.
//!
//! A primitive is an independent unit of policy or storage. The codec and the cryptography are
//! plain functions and values, while associations and nonces are kept in stores behind traits so
//! that a host may substitute a database or a distributed cache for the in-memory maps provided
//! here.
//!
//! ```ignore
//! # extern crate oxide_openid;
//! use oxide_openid::primitives::{
//!     association::AssociationMap,
//!     generator::NonceGenerator,
//!     nonce::NonceMap,
//! };
//!
//! let associations = AssociationMap::new();
//! let nonces = NonceMap::new(chrono::Duration::minutes(23));
//! let generator = NonceGenerator::with_strength(62f64.powi(8));
//! ```

use chrono::{DateTime, TimeZone, Utc};

pub mod association;
pub mod diffie_hellman;
pub mod generator;
pub mod kvform;
pub mod nonce;

/// Points in time are always in UTC.
pub type Time = DateTime<Utc>;

/// The time at a whole number of seconds since the unix epoch, if representable.
pub(crate) fn from_unix(seconds: i64) -> Option<Time> {
    Utc.timestamp_opt(seconds, 0).single()
}

/// Commonly used primitives for relying parties and providers.
pub mod prelude {
    pub use super::association::{Association, AssociationKind, AssociationMap, AssociationStore};
    pub use super::diffie_hellman::{DiffieHellman, SessionKind};
    pub use super::generator::{NonceGenerator, RandomGenerator};
    pub use super::kvform::Conformance;
    pub use super::nonce::{NonceMap, NonceStore};
    pub use super::Time;
}
