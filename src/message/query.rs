//! Access to the parameters of an incoming request.
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;

use serde::de;
use serde::Deserializer;
use url::Url;

use crate::channel::error::ProtocolError;

/// Allows access to the parameters of a query string, a form body or a key-value body.
///
/// Implemented for maps from 'str-likes' to single values or collections of values, and for
/// vectors of pairs. Popular instances may be:
/// * `HashMap<String, String>`
/// * `HashMap<String, Vec<String>>`
/// * `Vec<(String, String)>`
///
/// Implementations must report a key with several values as duplicate instead of picking one of
/// them, therefore the trait is marked as `unsafe`.
pub unsafe trait QueryParameter {
    /// Get the **unique** value associated with a key.
    ///
    /// If there are multiple values, return `None`. Different components picking different
    /// values of a repeated parameter could otherwise be played against each other, for example
    /// by presenting one value to signature verification and another to the application.
    fn unique_value(&self, key: &str) -> Option<Cow<str>>;

    /// Copy all parameters into the normal form, preserving duplicates as poisoned keys.
    fn normalize(&self) -> NormalizedParameter;
}

/// The parameter normal form.
///
/// Keeps the order in which keys first appeared. A key that appeared more than once is kept but
/// poisoned, so that it can be reported instead of silently dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NormalizedParameter {
    /// The value is `None` if the key appeared at least twice.
    inner: Vec<(Cow<'static, str>, Option<Cow<'static, str>>)>,
}

unsafe impl QueryParameter for NormalizedParameter {
    fn unique_value(&self, key: &str) -> Option<Cow<str>> {
        self.inner
            .iter()
            .find(|(existing, _)| existing == key)
            .and_then(|(_, val)| val.as_ref().map(Cow::as_ref).map(Cow::Borrowed))
    }

    fn normalize(&self) -> NormalizedParameter {
        self.clone()
    }
}

impl NormalizedParameter {
    /// Create an empty map.
    pub fn new() -> Self {
        NormalizedParameter::default()
    }

    /// Parse an `application/x-www-form-urlencoded` string.
    pub fn from_query(query: &str) -> Result<Self, ProtocolError> {
        serde_urlencoded::from_str(query)
            .map_err(|err| ProtocolError::Malformed(format!("invalid form encoding: {}", err)))
    }

    /// The parameters of the query string of an url.
    pub fn from_url(url: &Url) -> Self {
        url.query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    }

    /// Insert a key-value-pair or mark key as dead if already present.
    ///
    /// Since each key must appear at most once, we do not remove it from the map but instead mark
    /// the key as having a duplicate entry.
    pub fn insert_or_poison(&mut self, key: Cow<'static, str>, val: Cow<'static, str>) {
        match self.inner.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = None,
            None => self.inner.push((key, Some(val))),
        }
    }

    /// The first key that appeared more than once.
    pub fn first_duplicate(&self) -> Option<&str> {
        self.inner
            .iter()
            .find(|(_, val)| val.is_none())
            .map(|(key, _)| key.as_ref())
    }

    /// Whether a key is present, duplicated or not.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.iter().any(|(existing, _)| existing == key)
    }

    /// All pairs in order of appearance, or the first duplicated key as an error.
    pub fn pairs(&self) -> Result<Vec<(&str, &str)>, ProtocolError> {
        self.inner
            .iter()
            .map(|(key, val)| match val {
                Some(val) => Ok((key.as_ref(), val.as_ref())),
                None => Err(ProtocolError::DuplicateParameter(key.to_string())),
            })
            .collect()
    }

    /// The number of distinct keys.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<'de> de::Deserialize<'de> for NormalizedParameter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor(NormalizedParameter);

        impl<'a> de::Visitor<'a> for Visitor {
            type Value = NormalizedParameter;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a sequence of key-value-pairs")
            }

            fn visit_seq<A>(mut self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'a>,
            {
                while let Some((key, value)) = access.next_element::<(String, String)>()? {
                    self.0.insert_or_poison(key.into(), value.into())
                }

                Ok(self.0)
            }
        }

        let visitor = Visitor(NormalizedParameter::default());
        deserializer.deserialize_seq(visitor)
    }
}

impl<K, V> FromIterator<(K, V)> for NormalizedParameter
where
    K: Into<Cow<'static, str>>,
    V: Into<Cow<'static, str>>,
{
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (K, V)>,
    {
        let mut target = NormalizedParameter::default();
        iter.into_iter()
            .for_each(|(k, v)| target.insert_or_poison(k.into(), v.into()));
        target
    }
}

/// Return a reference to value in a collection if it is the only one.
pub unsafe trait UniqueValue {
    /// Borrow the unique value reference.
    fn get_unique(&self) -> Option<&str>;

    /// The number of values in the collection.
    fn count(&self) -> usize {
        1
    }
}

unsafe impl<K, V, S: BuildHasher> QueryParameter for HashMap<K, V, S>
where
    K: Borrow<str> + Eq + Hash,
    V: UniqueValue,
{
    fn unique_value(&self, key: &str) -> Option<Cow<str>> {
        self.get(key).and_then(V::get_unique).map(Cow::Borrowed)
    }

    fn normalize(&self) -> NormalizedParameter {
        let mut params = NormalizedParameter::default();
        for (key, val) in self.iter() {
            let key: Cow<'static, str> = Cow::Owned(key.borrow().to_string());
            match (val.get_unique(), val.count()) {
                (Some(value), 1) => params.insert_or_poison(key, Cow::Owned(value.to_string())),
                (_, 0) => (),
                _ => params.inner.push((key, None)),
            }
        }
        params
    }
}

unsafe impl<K, V> QueryParameter for Vec<(K, V)>
where
    K: Borrow<str>,
    V: Borrow<str>,
{
    fn unique_value(&self, key: &str) -> Option<Cow<str>> {
        let mut value = None;

        for entry in self.iter() {
            if entry.0.borrow() == key {
                if value.is_some() {
                    return None;
                }
                value = Some(Cow::Borrowed(entry.1.borrow()));
            }
        }

        value
    }

    fn normalize(&self) -> NormalizedParameter {
        self.iter()
            .map(|(key, val)| (key.borrow().to_string(), val.borrow().to_string()))
            .collect()
    }
}

unsafe impl<'a, Q: QueryParameter + 'a + ?Sized> QueryParameter for &'a Q {
    fn unique_value(&self, key: &str) -> Option<Cow<str>> {
        (**self).unique_value(key)
    }

    fn normalize(&self) -> NormalizedParameter {
        (**self).normalize()
    }
}

unsafe impl UniqueValue for String {
    fn get_unique(&self) -> Option<&str> {
        Some(self)
    }
}

unsafe impl<'a> UniqueValue for &'a str {
    fn get_unique(&self) -> Option<&str> {
        Some(self)
    }
}

unsafe impl<'a> UniqueValue for Cow<'a, str> {
    fn get_unique(&self) -> Option<&str> {
        Some(self.as_ref())
    }
}

unsafe impl<V: UniqueValue> UniqueValue for Vec<V> {
    fn get_unique(&self) -> Option<&str> {
        if self.len() > 1 {
            None
        } else {
            self.first().and_then(V::get_unique)
        }
    }

    fn count(&self) -> usize {
        self.len()
    }
}
