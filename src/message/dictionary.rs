//! A message viewed as an ordered map from wire names to values.
use super::Message;
use crate::channel::error::ProtocolError;

/// Read and write access to a message by wire name.
///
/// Described fields take precedence over extra data. Enumeration yields the described fields
/// that have a value, in the order of the description, followed by the extra data in insertion
/// order.
pub struct MessageDictionary<'a> {
    message: &'a mut dyn Message,
}

impl<'a> MessageDictionary<'a> {
    /// View the message.
    pub fn new(message: &'a mut dyn Message) -> Self {
        MessageDictionary { message }
    }

    /// The value for a wire name.
    pub fn get(&self, key: &str) -> Option<String> {
        read(&*self.message, key)
    }

    /// Whether the key has a value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set or clear the value for a wire name.
    ///
    /// Described fields decode the value into their typed representation, any other key is kept
    /// as extra data.
    pub fn set(&mut self, key: &str, value: Option<&str>) -> Result<(), ProtocolError> {
        let description = self.message.description();
        match description.field(key) {
            Some(field) => field.set_value(&mut *self.message, value),
            None => {
                match value {
                    Some(value) => self.message.extra_mut().insert(key, value),
                    None => {
                        self.message.extra_mut().remove(key);
                    }
                }
                Ok(())
            }
        }
    }

    /// All keys with a value.
    pub fn keys(&self) -> Vec<String> {
        pairs(&*self.message).into_iter().map(|(key, _)| key).collect()
    }

    /// All pairs with a value, in wire order.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        pairs(&*self.message)
    }

    /// Set every pair, stopping at the first value that can not be decoded.
    pub fn extend<I, K, V>(&mut self, pairs: I) -> Result<(), ProtocolError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in pairs {
            self.set(key.as_ref(), Some(value.as_ref()))?;
        }
        Ok(())
    }
}

/// The value of a wire name in a message that is only borrowed shared.
pub fn read(message: &dyn Message, key: &str) -> Option<String> {
    match message.description().field(key) {
        Some(field) => field.get_value(message),
        None => message.extra().get(key).map(str::to_string),
    }
}

/// All pairs of a message that is only borrowed shared, in wire order.
pub fn pairs(message: &dyn Message) -> Vec<(String, String)> {
    let description = message.description();
    let described = description
        .fields()
        .iter()
        .filter_map(|field| {
            field
                .get_value(message)
                .map(|value| (field.name().to_string(), value))
        });

    let extra = message
        .extra()
        .iter()
        .filter(|(key, _)| description.field(key).is_none())
        .map(|(key, value)| (key.to_string(), value.to_string()));

    described.chain(extra).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ExtraData, Field, MessageDescription, Transport, Version};
    use once_cell::sync::Lazy;

    #[derive(Debug, Default)]
    struct Sample {
        first: Option<String>,
        second: Option<String>,
        extra: ExtraData,
    }

    static SAMPLE: Lazy<MessageDescription> = Lazy::new(|| {
        MessageDescription::builder::<Sample>("sample")
            .field("first", Field::required(), |m| &m.first, |m| &mut m.first)
            .field("second", Field::optional(), |m| &m.second, |m| &mut m.second)
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
            Transport::Indirect
        }

        fn extra(&self) -> &ExtraData {
            &self.extra
        }

        fn extra_mut(&mut self) -> &mut ExtraData {
            &mut self.extra
        }
    }

    #[test]
    fn described_fields_first() {
        let mut sample = Sample::default();
        let mut dictionary = MessageDictionary::new(&mut sample);
        dictionary.set("ext.z", Some("1")).unwrap();
        dictionary.set("second", Some("2")).unwrap();
        dictionary.set("first", Some("3")).unwrap();
        dictionary.set("ext.a", Some("4")).unwrap();

        assert_eq!(dictionary.keys(), vec!["first", "second", "ext.z", "ext.a"]);
        assert_eq!(dictionary.get("second").as_deref(), Some("2"));
        assert_eq!(dictionary.get("ext.a").as_deref(), Some("4"));
        assert!(!dictionary.contains_key("missing"));

        dictionary.set("ext.z", None).unwrap();
        dictionary.set("second", None).unwrap();
        assert_eq!(dictionary.keys(), vec!["first", "ext.a"]);

        assert_eq!(sample.first.as_deref(), Some("3"));
        assert_eq!(sample.extra.len(), 1);
    }

    #[test]
    fn pairs_round_trip_through_a_fresh_message() {
        let mut sample = Sample::default();
        sample.first = Some("a".into());
        sample.extra.insert("ext.x", "y");
        let wire = pairs(&sample);

        let mut copy = Sample::default();
        MessageDictionary::new(&mut copy).extend(wire.clone()).unwrap();
        assert_eq!(pairs(&copy), wire);
    }
}
