//! Security settings shared by the channel and the association flows.
//!
//! Settings are plain values handed to constructors; nothing in the library reads global state.
//! Hosts typically load them once at startup, for example from a JSON file:
//!
//! ```
//! # extern crate oxide_openid;
//! use oxide_openid::config::SecuritySettings;
//!
//! let settings = SecuritySettings::from_json(r#"{
//!     "maximum_clock_skew": 300,
//!     "minimum_hash_bits": 256
//! }"#).unwrap();
//!
//! assert_eq!(settings.maximum_clock_skew, chrono::Duration::minutes(5));
//! assert_eq!(settings.maximum_hash_bits, 256);
//! ```
//!
//! Durations are given in whole seconds, missing settings keep their defaults.
use chrono::Duration;

use crate::primitives::generator::NonceGenerator;

/// Limits and lifetimes governing message protection and associations.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// How long a message may take from its creation until it is received.
    #[serde(with = "seconds")]
    pub maximum_message_lifetime: Duration,

    /// The largest expected difference between the clocks of two hosts.
    #[serde(with = "seconds")]
    pub maximum_clock_skew: Duration,

    /// The shortest acceptable association signature, in bits.
    pub minimum_hash_bits: usize,

    /// The longest supported association signature, in bits.
    pub maximum_hash_bits: usize,

    /// The size of the keyspace nonces are drawn from.
    pub nonce_strength: f64,

    /// Lifetime of associations a provider shares with relying parties.
    #[serde(with = "seconds")]
    pub association_lifetime: Duration,

    /// Lifetime of associations a provider signs with when it has none shared.
    #[serde(with = "seconds")]
    pub private_secret_lifetime: Duration,

    /// A relying party negotiates a new association when less than this remains.
    #[serde(with = "seconds")]
    pub minimum_useful_association_lifetime: Duration,

    /// Indirect messages with longer urls are sent as a form post instead of a redirect.
    pub indirect_get_to_post_threshold: usize,

    /// Whether a relying party may verify assertions directly when no association is possible.
    pub allow_dumb_mode: bool,
}

impl SecuritySettings {
    /// Parse settings from JSON, using defaults for missing values.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The age after which a message is rejected as expired.
    ///
    /// Both the sender and the receiver clock may be off, so twice the skew is allowed on top of
    /// the lifetime.
    pub fn maximum_message_age(&self) -> Duration {
        self.maximum_message_lifetime + self.maximum_clock_skew * 2
    }

    /// A nonce generator matching the configured strength.
    pub fn nonce_generator(&self) -> NonceGenerator {
        NonceGenerator::with_strength(self.nonce_strength)
    }

    /// Require association signatures of at least `bits`.
    pub fn require_hash_bits(&mut self, bits: usize) {
        self.minimum_hash_bits = bits;
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        SecuritySettings {
            maximum_message_lifetime: Duration::minutes(3),
            maximum_clock_skew: Duration::minutes(10),
            minimum_hash_bits: 160,
            maximum_hash_bits: 256,
            nonce_strength: 62f64.powi(8),
            association_lifetime: Duration::days(14),
            private_secret_lifetime: Duration::minutes(10),
            minimum_useful_association_lifetime: Duration::minutes(5),
            indirect_get_to_post_threshold: 2048,
            allow_dumb_mode: true,
        }
    }
}

/// Durations as a whole number of seconds.
mod seconds {
    use chrono::Duration;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = i64::deserialize(deserializer)?;
        Duration::try_seconds(seconds)
            .ok_or_else(|| D::Error::custom(format!("{} seconds is out of range", seconds)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = SecuritySettings::default();
        assert_eq!(settings.maximum_message_age(), Duration::minutes(23));
        assert_eq!(settings.nonce_generator().len(), 8);
        assert!(settings.allow_dumb_mode);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{ "allow_dumb_mode": false, "association_lifetime": 3600 }"#;
        let settings = SecuritySettings::from_json(json).unwrap();
        assert!(!settings.allow_dumb_mode);
        assert_eq!(settings.association_lifetime, Duration::hours(1));
        assert_eq!(settings.private_secret_lifetime, Duration::minutes(10));
    }

    #[test]
    fn json_round_trip() {
        let mut settings = SecuritySettings::default();
        settings.require_hash_bits(256);
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(SecuritySettings::from_json(&json).unwrap(), settings);
    }

    #[test]
    fn invalid_json() {
        assert!(SecuritySettings::from_json(r#"{ "minimum_hash_bits": "many" }"#).is_err());
    }

    #[test]
    fn out_of_range_duration() {
        let json = r#"{ "association_lifetime": 9223372036854775807 }"#;
        assert!(SecuritySettings::from_json(json).is_err());
        let json = r#"{ "maximum_clock_skew": -9223372036854775807 }"#;
        assert!(SecuritySettings::from_json(json).is_err());
    }
}
