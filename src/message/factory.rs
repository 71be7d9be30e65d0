//! Recognizing the concrete type of an incoming message.
//!
//! Parameters alone do not say which message they encode. A factory tries an ordered list of
//! recognizers, each looking for the parameters characteristic of one message type, and returns
//! the tag of the first match. More specific recognizers must therefore come before generic
//! ones. Finding no match is not an error, the parameters simply are not a message for us.
use std::fmt;

use super::query::{NormalizedParameter, QueryParameter};
use super::{Message, ReceivedMessage};
use crate::channel::binding::Protections;
use crate::channel::error::ProtocolError;

/// Creates empty messages of the type the parameters belong to.
pub trait MessageFactory: Send + Sync {
    /// The messages this factory creates.
    type Output: ReceivedMessage;

    /// The name and required protections of every message type this factory can create.
    ///
    /// The channel checks these against its binding elements when it is constructed.
    fn protection_requirements(&self) -> Vec<(&'static str, Protections)>;

    /// Recognize a request, either indirect or direct.
    fn recognize_request(
        &self,
        fields: &NormalizedParameter,
    ) -> Result<Option<Self::Output>, ProtocolError>;

    /// Recognize the response to a direct request.
    fn recognize_response(
        &self, request: &dyn Message, fields: &NormalizedParameter,
    ) -> Result<Option<Self::Output>, ProtocolError>;
}

/// A predicate on parameters, tagged with the message kind it recognizes.
pub struct Recognizer<K> {
    kind: K,
    matches: fn(&NormalizedParameter) -> bool,
}

impl<K: Copy> Recognizer<K> {
    /// Recognize `kind` whenever `matches` holds.
    pub fn new(kind: K, matches: fn(&NormalizedParameter) -> bool) -> Self {
        Recognizer { kind, matches }
    }

    /// Recognize `kind` when `key` has exactly the given value.
    pub fn value(kind: K, key: &'static str, value: &'static str) -> ValueRecognizer<K> {
        ValueRecognizer { kind, key, value }
    }
}

/// Recognizes a kind by the value of a single parameter, usually the mode.
#[derive(Clone, Copy, Debug)]
pub struct ValueRecognizer<K> {
    kind: K,
    key: &'static str,
    value: &'static str,
}

/// An ordered list of recognizers.
pub struct RecognizerChain<K> {
    entries: Vec<Entry<K>>,
}

enum Entry<K> {
    Predicate(Recognizer<K>),
    Value(ValueRecognizer<K>),
}

impl<K: Copy + fmt::Debug> RecognizerChain<K> {
    /// An empty chain, recognizing nothing.
    pub fn new() -> Self {
        RecognizerChain { entries: Vec::new() }
    }

    /// Append a predicate, tried after all previous entries.
    pub fn then(mut self, recognizer: Recognizer<K>) -> Self {
        self.entries.push(Entry::Predicate(recognizer));
        self
    }

    /// Append a value comparison, tried after all previous entries.
    pub fn then_value(mut self, recognizer: ValueRecognizer<K>) -> Self {
        self.entries.push(Entry::Value(recognizer));
        self
    }

    /// The kind of the first matching recognizer.
    pub fn recognize(&self, fields: &NormalizedParameter) -> Option<K> {
        let found = self.entries.iter().find_map(|entry| match entry {
            Entry::Predicate(recognizer) if (recognizer.matches)(fields) => Some(recognizer.kind),
            Entry::Value(recognizer)
                if fields.unique_value(recognizer.key).as_deref() == Some(recognizer.value) =>
            {
                Some(recognizer.kind)
            }
            _ => None,
        });

        trace!("Recognized parameters as {:?}", found);
        found
    }

    /// The kinds of all entries, in order.
    pub fn kinds(&self) -> Vec<K> {
        self.entries
            .iter()
            .map(|entry| match entry {
                Entry::Predicate(recognizer) => recognizer.kind,
                Entry::Value(recognizer) => recognizer.kind,
            })
            .collect()
    }
}

impl<K: Copy + fmt::Debug> Default for RecognizerChain<K> {
    fn default() -> Self {
        RecognizerChain::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Kind {
        Specific,
        Generic,
    }

    fn chain() -> RecognizerChain<Kind> {
        RecognizerChain::new()
            .then(Recognizer::new(Kind::Specific, |fields| {
                fields.unique_value("mode").as_deref() == Some("id_res")
                    && fields.contains_key("sig")
            }))
            .then_value(Recognizer::value(Kind::Generic, "mode", "id_res"))
    }

    #[test]
    fn most_specific_first() {
        let specific: NormalizedParameter =
            vec![("mode", "id_res"), ("sig", "x")].into_iter().collect();
        assert_eq!(chain().recognize(&specific), Some(Kind::Specific));

        let generic: NormalizedParameter = vec![("mode", "id_res")].into_iter().collect();
        assert_eq!(chain().recognize(&generic), Some(Kind::Generic));
    }

    #[test]
    fn unrecognized_is_none() {
        let other: NormalizedParameter = vec![("mode", "other")].into_iter().collect();
        assert_eq!(chain().recognize(&other), None);
        assert_eq!(chain().recognize(&NormalizedParameter::new()), None);
        assert_eq!(chain().kinds(), vec![Kind::Specific, Kind::Generic]);
    }
}
