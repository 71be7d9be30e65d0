//! Declarative schemas of message types.
//!
//! A `MessageDescription` is built once per message type, usually in a `once_cell` static, and
//! lists the fields of the type in wire order. Each field knows whether it is required, whether
//! it must be covered by the signature, and whether an empty value is meaningful. Values are
//! converted between their typed representation and the wire through `WireValue`.
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use base64::{decode, encode};
use chrono::Duration;
use num_bigint::BigUint;
use url::Url;

use super::Message;
use crate::channel::error::ProtocolError;
use crate::primitives::association::AssociationKind;
use crate::primitives::diffie_hellman::{decode_number, encode_number, SessionKind};

type Getter = Box<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>;
type Setter = Box<dyn Fn(&mut dyn Any, Option<&str>) -> Result<(), ProtocolError> + Send + Sync>;

/// A type with a textual wire representation.
pub trait WireValue: Sized {
    /// Encode the value.
    fn to_wire(&self) -> String;

    /// Decode a value received from the other party.
    fn from_wire(value: &str) -> Result<Self, ProtocolError>;
}

/// Flags of a described field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    required: bool,
    signed: bool,
    allow_empty: bool,
}

impl Field {
    /// A field which must have a value before the message is sent or after it is received.
    pub fn required() -> Self {
        Field {
            required: true,
            signed: false,
            allow_empty: false,
        }
    }

    /// A field which may be absent.
    pub fn optional() -> Self {
        Field {
            required: false,
            signed: false,
            allow_empty: false,
        }
    }

    /// Whenever present, the field must be covered by the signature.
    pub fn signed(self) -> Self {
        Field { signed: true, ..self }
    }

    /// The empty string is a value of its own instead of meaning absence.
    pub fn allow_empty(self) -> Self {
        Field {
            allow_empty: true,
            ..self
        }
    }
}

/// One named field of a message type.
pub struct FieldDescription {
    name: &'static str,
    flags: Field,
    get: Getter,
    set: Setter,
}

impl FieldDescription {
    /// The wire name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a value is required.
    pub fn is_required(&self) -> bool {
        self.flags.required
    }

    /// Whether the field must be signed when present.
    pub fn is_signed(&self) -> bool {
        self.flags.signed
    }

    /// Whether an empty value differs from absence.
    pub fn allows_empty(&self) -> bool {
        self.flags.allow_empty
    }

    /// The encoded value of the field in the message.
    ///
    /// An empty value is reported as absent unless the field allows empty values.
    pub fn get_value(&self, message: &dyn Message) -> Option<String> {
        let value = (self.get)(message.as_any())?;
        if value.is_empty() && !self.flags.allow_empty {
            None
        } else {
            Some(value)
        }
    }

    /// Decode and store a value in the message, or clear it.
    ///
    /// Setting an empty value clears the field unless the field allows empty values.
    pub fn set_value(
        &self,
        message: &mut dyn Message,
        value: Option<&str>,
    ) -> Result<(), ProtocolError> {
        let allow_empty = self.flags.allow_empty;
        let value = value.filter(|value| allow_empty || !value.is_empty());
        (self.set)(message.as_any_mut(), value)
    }
}

impl fmt::Debug for FieldDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FieldDescription")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

/// The schema of a message type.
#[derive(Debug)]
pub struct MessageDescription {
    name: &'static str,
    fields: Vec<FieldDescription>,
}

impl MessageDescription {
    /// Start describing the message type `M`.
    pub fn builder<M: Any>(name: &'static str) -> DescriptionBuilder<M> {
        DescriptionBuilder {
            name,
            fields: Vec::new(),
            message: PhantomData,
        }
    }

    /// A human readable name of the message type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// All described fields in wire order.
    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// Look up a field by its wire name.
    pub fn field(&self, name: &str) -> Option<&FieldDescription> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// The fields that must be signed when present.
    pub fn signed_fields(&self) -> impl Iterator<Item = &FieldDescription> {
        self.fields.iter().filter(|field| field.is_signed())
    }

    /// Check that every required field of the message has a value.
    pub fn ensure_required(&self, message: &dyn Message) -> Result<(), ProtocolError> {
        for field in self.fields.iter().filter(|field| field.is_required()) {
            if field.get_value(message).is_none() {
                return Err(ProtocolError::MissingRequiredField {
                    message: self.name,
                    field: field.name.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Collects the fields of a message type.
pub struct DescriptionBuilder<M> {
    name: &'static str,
    fields: Vec<FieldDescription>,
    message: PhantomData<fn(M)>,
}

impl<M: Any> DescriptionBuilder<M> {
    /// A field stored as an optional typed value of the message.
    pub fn field<T: WireValue + 'static>(
        self, name: &'static str, flags: Field, get: fn(&M) -> &Option<T>,
        get_mut: fn(&mut M) -> &mut Option<T>,
    ) -> Self {
        self.computed(
            name,
            flags,
            move |message| get(message).as_ref().map(T::to_wire),
            move |message, value| {
                *get_mut(message) = match value {
                    Some(value) => Some(T::from_wire(value).map_err(|err| attribute(err, name))?),
                    None => None,
                };
                Ok(())
            },
        )
    }

    /// A field with custom conversion, for values derived from other state of the message.
    pub fn computed<G, S>(mut self, name: &'static str, flags: Field, get: G, set: S) -> Self
    where
        G: Fn(&M) -> Option<String> + Send + Sync + 'static,
        S: Fn(&mut M, Option<&str>) -> Result<(), ProtocolError> + Send + Sync + 'static,
    {
        let message_name = self.name;
        let get: Getter = Box::new(move |any: &dyn Any| {
            any.downcast_ref::<M>().and_then(|message| get(message))
        });
        let set: Setter = Box::new(move |any: &mut dyn Any, value: Option<&str>| {
            match any.downcast_mut::<M>() {
                Some(message) => set(message, value),
                None => Err(ProtocolError::Configuration(format!(
                    "field {} of {} accessed on another message type",
                    name, message_name
                ))),
            }
        });

        self.fields.push(FieldDescription { name, flags, get, set });
        self
    }

    /// A field with a fixed value, such as the mode of a message.
    ///
    /// Receiving a different value is an error.
    pub fn constant(self, name: &'static str, flags: Field, constant: &'static str) -> Self {
        self.computed(
            name,
            flags,
            move |_| Some(constant.to_string()),
            move |_, value| match value {
                Some(value) if value != constant => Err(ProtocolError::InvalidFieldValue {
                    field: name.to_string(),
                    reason: format!("expected {:?}", constant),
                }),
                _ => Ok(()),
            },
        )
    }

    /// Finish the description.
    pub fn build(self) -> MessageDescription {
        MessageDescription {
            name: self.name,
            fields: self.fields,
        }
    }
}

/// Name the field a generic conversion error occurred in.
fn attribute(err: ProtocolError, field: &str) -> ProtocolError {
    match err {
        ProtocolError::InvalidFieldValue { reason, .. } => ProtocolError::InvalidFieldValue {
            field: field.to_string(),
            reason,
        },
        other => other,
    }
}

fn invalid(reason: &str) -> ProtocolError {
    ProtocolError::InvalidFieldValue {
        field: String::new(),
        reason: reason.to_string(),
    }
}

impl WireValue for String {
    fn to_wire(&self) -> String {
        self.clone()
    }

    fn from_wire(value: &str) -> Result<Self, ProtocolError> {
        Ok(value.to_string())
    }
}

impl WireValue for bool {
    fn to_wire(&self) -> String {
        String::from(if *self { "true" } else { "false" })
    }

    fn from_wire(value: &str) -> Result<Self, ProtocolError> {
        match value {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(invalid("expected true or false")),
        }
    }
}

impl WireValue for Url {
    fn to_wire(&self) -> String {
        self.as_str().to_string()
    }

    fn from_wire(value: &str) -> Result<Self, ProtocolError> {
        Url::parse(value).map_err(|_| invalid("not an absolute url"))
    }
}

/// Raw bytes are transmitted in base64.
impl WireValue for Vec<u8> {
    fn to_wire(&self) -> String {
        encode(self)
    }

    fn from_wire(value: &str) -> Result<Self, ProtocolError> {
        decode(value).map_err(|_| invalid("not base64"))
    }
}

/// Durations are transmitted as whole seconds.
impl WireValue for Duration {
    fn to_wire(&self) -> String {
        self.num_seconds().to_string()
    }

    fn from_wire(value: &str) -> Result<Self, ProtocolError> {
        match value.parse::<i64>() {
            Ok(seconds) if seconds >= 0 => {
                Duration::try_seconds(seconds).ok_or_else(|| invalid("duration out of range"))
            }
            _ => Err(invalid("not a non-negative number of seconds")),
        }
    }
}

/// Lists are comma separated, as the names of signed fields.
impl WireValue for Vec<String> {
    fn to_wire(&self) -> String {
        self.join(",")
    }

    fn from_wire(value: &str) -> Result<Self, ProtocolError> {
        Ok(value
            .split(',')
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl WireValue for BigUint {
    fn to_wire(&self) -> String {
        encode_number(self)
    }

    fn from_wire(value: &str) -> Result<Self, ProtocolError> {
        decode_number("", value)
    }
}

impl WireValue for AssociationKind {
    fn to_wire(&self) -> String {
        self.name().to_string()
    }

    fn from_wire(value: &str) -> Result<Self, ProtocolError> {
        AssociationKind::from_name(value)
    }
}

impl WireValue for SessionKind {
    fn to_wire(&self) -> String {
        self.name().to_string()
    }

    fn from_wire(value: &str) -> Result<Self, ProtocolError> {
        SessionKind::from_name(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ExtraData, Transport, Version};
    use once_cell::sync::Lazy;

    #[derive(Debug, Default)]
    struct Sample {
        text: Option<String>,
        flag: Option<bool>,
        empty: Option<String>,
        extra: ExtraData,
    }

    static SAMPLE: Lazy<MessageDescription> = Lazy::new(|| {
        MessageDescription::builder::<Sample>("sample")
            .constant("mode", Field::required().signed(), "sample")
            .field("text", Field::required().signed(), |m| &m.text, |m| &mut m.text)
            .field("flag", Field::optional(), |m| &m.flag, |m| &mut m.flag)
            .field("empty", Field::optional().allow_empty(), |m| &m.empty, |m| &mut m.empty)
            .build()
    });

    impl Message for Sample {
        fn description(&self) -> &'static MessageDescription {
            &SAMPLE
        }

        fn version(&self) -> Version {
            Version::V20
        }

        fn transport(&self) -> Transport {
            Transport::Direct
        }

        fn extra(&self) -> &ExtraData {
            &self.extra
        }

        fn extra_mut(&mut self) -> &mut ExtraData {
            &mut self.extra
        }
    }

    #[test]
    fn typed_fields_convert() {
        let mut sample = Sample::default();
        let flag = SAMPLE.field("flag").unwrap();
        flag.set_value(&mut sample, Some("true")).unwrap();
        assert_eq!(sample.flag, Some(true));
        assert_eq!(flag.get_value(&sample).as_deref(), Some("true"));

        match flag.set_value(&mut sample, Some("yes")) {
            Err(ProtocolError::InvalidFieldValue { field, .. }) => assert_eq!(field, "flag"),
            other => panic!("Expected invalid field value, got {:?}", other),
        }
    }

    #[test]
    fn empty_means_absent_unless_allowed() {
        let mut sample = Sample::default();
        let text = SAMPLE.field("text").unwrap();
        text.set_value(&mut sample, Some("")).unwrap();
        assert_eq!(sample.text, None);

        sample.text = Some(String::new());
        assert_eq!(text.get_value(&sample), None);

        let empty = SAMPLE.field("empty").unwrap();
        empty.set_value(&mut sample, Some("")).unwrap();
        assert_eq!(sample.empty, Some(String::new()));
        assert_eq!(empty.get_value(&sample).as_deref(), Some(""));
    }

    #[test]
    fn required_fields_are_enforced() {
        let mut sample = Sample::default();
        match SAMPLE.ensure_required(&sample) {
            Err(ProtocolError::MissingRequiredField { message, field }) => {
                assert_eq!(message, "sample");
                assert_eq!(field, "text");
            }
            other => panic!("Expected missing field, got {:?}", other),
        }

        sample.text = Some("value".into());
        SAMPLE.ensure_required(&sample).unwrap();
    }

    #[test]
    fn constants_reject_other_values() {
        let mut sample = Sample::default();
        let mode = SAMPLE.field("mode").unwrap();
        assert!(mode.set_value(&mut sample, Some("sample")).is_ok());
        assert!(mode.set_value(&mut sample, Some("other")).is_err());
        assert_eq!(mode.get_value(&sample).as_deref(), Some("sample"));
    }

    #[test]
    fn signed_fields_in_order() {
        let names: Vec<_> = SAMPLE.signed_fields().map(FieldDescription::name).collect();
        assert_eq!(names, vec!["mode", "text"]);
    }

    #[test]
    fn wire_values() {
        assert_eq!(Duration::from_wire("1209600").unwrap(), Duration::days(14));
        assert!(Duration::from_wire("-1").is_err());
        assert!(Duration::from_wire("99999999999999999").is_err());
        assert_eq!(
            Vec::<String>::from_wire("mode,return_to").unwrap(),
            vec!["mode".to_string(), "return_to".to_string()]
        );
        assert_eq!(vec![0u8, 1, 2].to_wire(), "AAEC");
        assert!(Url::from_wire("relative/path").is_err());
        assert!(matches!(
            AssociationKind::from_wire("HMAC-MD5"),
            Err(ProtocolError::UnsupportedAlgorithm(_))
        ));
    }
}
