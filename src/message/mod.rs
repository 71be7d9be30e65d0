//! Typed protocol messages and their generic wire view.
//!
//! Every concrete message is a plain struct implementing [`Message`]. Its static
//! [`MessageDescription`] lists the named fields the struct maps to, and a [`MessageDictionary`]
//! presents any message as an ordered map of wire names to string values. Parameters which are
//! not described are kept verbatim in the [`ExtraData`] of the message, so extensions survive a
//! round trip through the typed representation.
//!
//! The binding elements of a channel need more than the field values. A message opts into
//! expiration, replay protection and signing by returning the respective capability from
//! [`Message::expiring`], [`Message::replay_protected`] and [`Message::signed`].
//!
//! [`Message`]: trait.Message.html
//! [`Message::expiring`]: trait.Message.html#method.expiring
//! [`Message::replay_protected`]: trait.Message.html#method.replay_protected
//! [`Message::signed`]: trait.Message.html#method.signed
//! [`MessageDescription`]: description/struct.MessageDescription.html
//! [`MessageDictionary`]: dictionary/struct.MessageDictionary.html
//! [`ExtraData`]: struct.ExtraData.html
use std::any::Any;
use std::fmt;

use url::Url;

use crate::channel::binding::Protections;
use crate::channel::error::ProtocolError;
use crate::primitives::Time;

pub mod description;
pub mod dictionary;
pub mod factory;
pub mod query;

pub use self::description::{Field, FieldDescription, MessageDescription};
pub use self::dictionary::MessageDictionary;

/// The namespace identifying OpenID 2.0 messages.
pub const OPENID2_NAMESPACE: &str = "http://specs.openid.net/auth/2.0";

/// The protocol version a message conforms to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    /// OpenID 1.1, whose messages carry no namespace.
    V11,

    /// OpenID 2.0.
    V20,
}

impl Version {
    /// The value of the `ns` parameter, if the version has one.
    pub fn namespace(self) -> Option<&'static str> {
        match self {
            Version::V11 => None,
            Version::V20 => Some(OPENID2_NAMESPACE),
        }
    }

    /// Determine the version from the `ns` parameter.
    ///
    /// An absent namespace means OpenID 1.1, an unknown one is an error.
    pub fn from_namespace(ns: Option<&str>) -> Result<Self, ProtocolError> {
        match ns {
            None => Ok(Version::V11),
            Some(OPENID2_NAMESPACE) => Ok(Version::V20),
            Some(other) => Err(ProtocolError::UnsupportedVersion(other.to_string())),
        }
    }
}

/// How a message travels between the parties.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Through a POST request from one party to the other and its response.
    Direct,

    /// Through the user agent, as a redirect or an automatically submitted form.
    Indirect,
}

/// Parameters of a message which its description does not cover.
///
/// The order in which parameters were first inserted is preserved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtraData {
    pairs: Vec<(String, String)>,
}

impl ExtraData {
    /// No extra parameters.
    pub fn new() -> Self {
        ExtraData::default()
    }

    /// The value of a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    /// Set a parameter, keeping its position if it already exists.
    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let (key, value) = (key.into(), value.into());
        match self.pairs.iter_mut().find(|(existing, _)| *existing == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    /// Remove a parameter, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.pairs.iter().position(|(existing, _)| existing == key)?;
        Some(self.pairs.remove(idx).1)
    }

    /// All parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// The number of parameters.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Conversion to `Any`, for every sized `'static` type.
///
/// Descriptions access the fields of their concrete message type through this.
pub trait AsAny: Any {
    /// View as `Any`.
    fn as_any(&self) -> &dyn Any;

    /// View as mutable `Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A protocol message.
pub trait Message: AsAny + Send + fmt::Debug {
    /// The schema of this message type.
    ///
    /// Implementations return the same static description for every instance of a type.
    fn description(&self) -> &'static MessageDescription;

    /// The protocol version of the message.
    fn version(&self) -> Version;

    /// How the message is transported.
    fn transport(&self) -> Transport;

    /// Parameters not covered by the description.
    fn extra(&self) -> &ExtraData;

    /// Mutable access to parameters not covered by the description.
    fn extra_mut(&mut self) -> &mut ExtraData;

    /// Check constraints between fields that the description can not express.
    fn validate(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Whether the message reports an error to the other party.
    fn is_error(&self) -> bool {
        false
    }

    /// The protections the binding elements must apply to this message.
    fn required_protections(&self) -> Protections {
        Protections::none()
    }

    /// The creation time, for messages that expire.
    fn expiring(&mut self) -> Option<&mut dyn Expiring> {
        None
    }

    /// The nonce, for messages protected against replay.
    fn replay_protected(&mut self) -> Option<&mut dyn ReplayProtected> {
        None
    }

    /// The signature, for signed messages.
    fn signed(&mut self) -> Option<&mut dyn Signed> {
        None
    }
}

/// A message that is only valid for a limited time after its creation.
pub trait Expiring {
    /// When the message was created, if known.
    fn created(&self) -> Option<Time>;

    /// Stamp the creation time.
    fn set_created(&mut self, created: Time);
}

/// A message carrying a nonce so that it is only processed once.
pub trait ReplayProtected {
    /// Separates nonce spaces, usually the identity of the party choosing the nonce.
    fn nonce_context(&self) -> Option<String>;

    /// The nonce, if set.
    fn nonce(&self) -> Option<&str>;

    /// Set a freshly generated nonce.
    fn set_nonce(&mut self, nonce: String);

    /// The time at which the nonce was issued.
    fn nonce_timestamp(&self) -> Option<Time>;
}

/// A message signed with an association.
pub trait Signed {
    /// The handle of the association the message is or should be signed with.
    fn association_handle(&self) -> Option<&str>;

    /// Record the association that signed the message.
    fn set_association_handle(&mut self, handle: String);

    /// A handle the receiving party should discard.
    fn invalidate_handle(&self) -> Option<&str>;

    /// Ask the receiving party to discard an association.
    fn set_invalidate_handle(&mut self, handle: Option<String>);

    /// The names of the signed fields, without prefix, in signature order.
    fn signed_fields(&self) -> Option<&[String]>;

    /// Record the names of the signed fields.
    fn set_signed_fields(&mut self, fields: Vec<String>);

    /// The raw signature.
    fn signature(&self) -> Option<&[u8]>;

    /// Attach the signature.
    fn set_signature(&mut self, signature: Vec<u8>);

    /// The endpoint of the party that signed the message.
    ///
    /// A relying party keeps its associations under this key.
    fn signer_endpoint(&self) -> Option<&Url>;
}

/// A message as returned by a channel, after all binding elements verified it.
pub trait ReceivedMessage: fmt::Debug {
    /// View the message.
    fn message(&self) -> &dyn Message;

    /// Mutably view the message.
    fn message_mut(&mut self) -> &mut dyn Message;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_data_keeps_order() {
        let mut extra = ExtraData::new();
        extra.insert("openid.ext1.b", "1");
        extra.insert("openid.ext1.a", "2");
        extra.insert("openid.ext1.b", "3");
        let pairs: Vec<_> = extra.iter().collect();
        assert_eq!(pairs, vec![("openid.ext1.b", "3"), ("openid.ext1.a", "2")]);
        assert_eq!(extra.remove("openid.ext1.b").as_deref(), Some("3"));
        assert_eq!(extra.len(), 1);
        assert!(extra.remove("missing").is_none());
    }

    #[test]
    fn namespace_version() {
        assert_eq!(Version::from_namespace(None).unwrap(), Version::V11);
        assert_eq!(Version::from_namespace(Some(OPENID2_NAMESPACE)).unwrap(), Version::V20);
        assert!(Version::from_namespace(Some("http://openid.net/signon/1.1")).is_err());
        assert_eq!(Version::V20.namespace(), Some(OPENID2_NAMESPACE));
        assert_eq!(Version::V11.namespace(), None);
    }
}
