//! Binding elements and the protections they provide.
//!
//! A binding element transforms every outgoing message before it is encoded and checks every
//! incoming message after it is decoded. Each element declares at most one protection. The
//! channel orders its elements by that protection, which makes the sending and receiving passes
//! mirror images of each other:
//!
//! | sending              | receiving            |
//! |----------------------|----------------------|
//! | expiration           | tamper protection    |
//! | replay protection    | replay protection    |
//! | tamper protection    | expiration           |
//!
//! Verifying the signature first on receipt ensures that forged messages never consume space
//! in the nonce store.
use std::fmt;

use crate::channel::error::ProtocolError;
use crate::message::Message;

/// A protection a binding element applies to messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtectionKind {
    /// Messages are timestamped and rejected once too old.
    Expiration,

    /// Messages carry a nonce and are rejected when seen twice.
    ReplayProtection,

    /// Messages are signed and rejected if the signature does not verify.
    TamperProtection,
}

impl ProtectionKind {
    /// All protections, in the order they are applied when sending.
    pub const ALL: [ProtectionKind; 3] = [
        ProtectionKind::Expiration,
        ProtectionKind::ReplayProtection,
        ProtectionKind::TamperProtection,
    ];

    /// The protection this one is meaningless without.
    ///
    /// A nonce only needs to be remembered until the message expires, and a timestamp can only
    /// be trusted when it is signed.
    pub fn depends_on(self) -> Option<ProtectionKind> {
        match self {
            ProtectionKind::Expiration => Some(ProtectionKind::TamperProtection),
            ProtectionKind::ReplayProtection => Some(ProtectionKind::Expiration),
            ProtectionKind::TamperProtection => None,
        }
    }

    fn bit(self) -> u8 {
        match self {
            ProtectionKind::Expiration => 0b001,
            ProtectionKind::ReplayProtection => 0b010,
            ProtectionKind::TamperProtection => 0b100,
        }
    }
}

impl fmt::Display for ProtectionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ProtectionKind::Expiration => "expiration",
            ProtectionKind::ReplayProtection => "replay protection",
            ProtectionKind::TamperProtection => "tamper protection",
        })
    }
}

/// A set of protections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Protections(u8);

impl Protections {
    /// The empty set.
    pub fn none() -> Self {
        Protections(0)
    }

    /// Every protection.
    pub fn all() -> Self {
        ProtectionKind::ALL.iter().cloned().collect()
    }

    /// Add a protection, returning whether it was newly added.
    pub fn insert(&mut self, kind: ProtectionKind) -> bool {
        let new = !self.contains(kind);
        self.0 |= kind.bit();
        new
    }

    /// Whether the protection is in the set.
    pub fn contains(self, kind: ProtectionKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Whether every protection of `other` is also in this set.
    pub fn covers(self, other: Protections) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The protections in the set, in sending order.
    pub fn iter(self) -> impl Iterator<Item = ProtectionKind> {
        ProtectionKind::ALL.iter().cloned().filter(move |kind| self.contains(*kind))
    }
}

impl From<ProtectionKind> for Protections {
    fn from(kind: ProtectionKind) -> Self {
        Protections(kind.bit())
    }
}

impl std::iter::FromIterator<ProtectionKind> for Protections {
    fn from_iter<T: IntoIterator<Item = ProtectionKind>>(iter: T) -> Self {
        let mut set = Protections::none();
        iter.into_iter().for_each(|kind| {
            set.insert(kind);
        });
        set
    }
}

impl fmt::Display for Protections {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no protection");
        }

        let names: Vec<_> = self.iter().map(|kind| kind.to_string()).collect();
        f.write_str(&names.join(", "))
    }
}

/// A step of the message pipeline of a channel.
///
/// Both methods return the protection they applied, or `None` if the message does not need it.
/// An element must never report a protection other than the one it declares.
pub trait BindingElement: Send + Sync {
    /// The protection this element applies.
    fn protection(&self) -> Option<ProtectionKind>;

    /// Transform an outgoing message, for example by signing it.
    fn prepare_for_sending(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError>;

    /// Check an incoming message, for example by verifying its signature.
    fn prepare_for_receiving(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError>;
}

impl<B: BindingElement + ?Sized> BindingElement for Box<B> {
    fn protection(&self) -> Option<ProtectionKind> {
        (**self).protection()
    }

    fn prepare_for_sending(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError> {
        (**self).prepare_for_sending(message)
    }

    fn prepare_for_receiving(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError> {
        (**self).prepare_for_receiving(message)
    }
}

/// The ordered binding elements of a channel.
pub struct Pipeline {
    /// Elements in sending order.
    elements: Vec<Box<dyn BindingElement>>,
    offered: Protections,
}

impl Pipeline {
    /// Order the elements and check that their protections are consistent.
    ///
    /// Two elements offering the same protection, or an element whose protection depends on one
    /// no element offers, are configuration errors.
    pub fn new(mut elements: Vec<Box<dyn BindingElement>>) -> Result<Self, ProtocolError> {
        let mut offered = Protections::none();
        for kind in elements.iter().filter_map(|element| element.protection()) {
            if !offered.insert(kind) {
                return Err(ProtocolError::Configuration(format!(
                    "more than one binding element offers {}",
                    kind
                )));
            }
        }

        for kind in offered.iter() {
            if let Some(dependency) = kind.depends_on() {
                if !offered.contains(dependency) {
                    return Err(ProtocolError::Configuration(format!(
                        "{} requires a binding element offering {}",
                        kind, dependency
                    )));
                }
            }
        }

        // Elements without protection run right before signing, which must come last.
        elements.sort_by_key(|element| match element.protection() {
            Some(ProtectionKind::Expiration) => 0,
            Some(ProtectionKind::ReplayProtection) => 1,
            None => 2,
            Some(ProtectionKind::TamperProtection) => 3,
        });

        Ok(Pipeline { elements, offered })
    }

    /// The protections the elements can apply.
    pub fn offered(&self) -> Protections {
        self.offered
    }

    /// Run the sending pass.
    ///
    /// `complete` checks the message for required fields and is run right before it is signed.
    pub fn process_outgoing<F>(
        &self,
        message: &mut dyn Message,
        complete: F,
    ) -> Result<(), ProtocolError>
    where
        F: Fn(&dyn Message) -> Result<(), ProtocolError>,
    {
        let mut applied = Protections::none();
        let mut checked = false;

        for element in &self.elements {
            if !checked && element.protection() == Some(ProtectionKind::TamperProtection) {
                complete(&*message)?;
                checked = true;
            }

            if let Some(kind) = element.prepare_for_sending(message)? {
                debug!("Applied {} to outgoing {}", kind, message.description().name());
                if !applied.insert(kind) {
                    return Err(ProtocolError::DuplicateProtection(kind));
                }
            }
        }

        if !checked {
            complete(&*message)?;
        }

        ensure_protected(&*message, applied)
    }

    /// Run the receiving pass, in reverse order.
    pub fn process_incoming(&self, message: &mut dyn Message) -> Result<(), ProtocolError> {
        let mut applied = Protections::none();

        for element in self.elements.iter().rev() {
            if let Some(kind) = element.prepare_for_receiving(message)? {
                debug!("Verified {} of incoming {}", kind, message.description().name());
                if !applied.insert(kind) {
                    warn!(
                        "Protection {} verified twice on incoming {}",
                        kind,
                        message.description().name()
                    );
                }
            }
        }

        ensure_protected(&*message, applied)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("elements", &self.elements.len())
            .field("offered", &self.offered)
            .finish()
    }
}

fn ensure_protected(message: &dyn Message, applied: Protections) -> Result<(), ProtocolError> {
    let required = message.required_protections();
    if applied.covers(required) {
        Ok(())
    } else {
        Err(ProtocolError::Unprotected { required, applied })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use once_cell::sync::Lazy;

    use crate::message::{ExtraData, MessageDescription, Transport, Version};

    #[derive(Debug, Default)]
    struct Sample {
        required: Protections,
        extra: ExtraData,
    }

    static SAMPLE: Lazy<MessageDescription> =
        Lazy::new(|| MessageDescription::builder::<Sample>("sample").build());

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

        fn required_protections(&self) -> Protections {
            self.required
        }
    }

    /// Records the order in which elements ran.
    struct Recorder {
        kind: Option<ProtectionKind>,
        applies: Option<ProtectionKind>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn boxed(
            kind: Option<ProtectionKind>,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Box<dyn BindingElement> {
            Box::new(Recorder {
                kind,
                applies: kind,
                log: log.clone(),
            })
        }
    }

    impl BindingElement for Recorder {
        fn protection(&self) -> Option<ProtectionKind> {
            self.kind
        }

        fn prepare_for_sending(
            &self,
            _: &mut dyn Message,
        ) -> Result<Option<ProtectionKind>, ProtocolError> {
            self.log.lock().unwrap().push(format!("send {:?}", self.kind));
            Ok(self.applies)
        }

        fn prepare_for_receiving(
            &self,
            _: &mut dyn Message,
        ) -> Result<Option<ProtectionKind>, ProtocolError> {
            self.log.lock().unwrap().push(format!("receive {:?}", self.kind));
            Ok(self.applies)
        }
    }

    fn full(log: &Arc<Mutex<Vec<String>>>) -> Vec<Box<dyn BindingElement>> {
        vec![
            Recorder::boxed(Some(ProtectionKind::TamperProtection), log),
            Recorder::boxed(Some(ProtectionKind::ReplayProtection), log),
            Recorder::boxed(Some(ProtectionKind::Expiration), log),
        ]
    }

    #[test]
    fn sending_and_receiving_orders_mirror() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(full(&log)).unwrap();
        let mut message = Sample {
            required: Protections::all(),
            ..Sample::default()
        };

        let complete_log = log.clone();
        pipeline
            .process_outgoing(&mut message, move |_| {
                complete_log.lock().unwrap().push("complete".into());
                Ok(())
            })
            .unwrap();
        pipeline.process_incoming(&mut message).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "send Some(Expiration)",
                "send Some(ReplayProtection)",
                "complete",
                "send Some(TamperProtection)",
                "receive Some(TamperProtection)",
                "receive Some(ReplayProtection)",
                "receive Some(Expiration)",
            ]
        );
    }

    #[test]
    fn duplicate_protections_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut elements = full(&log);
        elements.push(Recorder::boxed(Some(ProtectionKind::TamperProtection), &log));
        assert!(matches!(Pipeline::new(elements), Err(ProtocolError::Configuration(_))));
    }

    #[test]
    fn dependencies_are_enforced() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let replay_only = vec![
            Recorder::boxed(Some(ProtectionKind::ReplayProtection), &log),
            Recorder::boxed(Some(ProtectionKind::TamperProtection), &log),
        ];
        assert!(Pipeline::new(replay_only).is_err());

        let expiration_only = vec![Recorder::boxed(Some(ProtectionKind::Expiration), &log)];
        assert!(Pipeline::new(expiration_only).is_err());

        let signing_only = vec![Recorder::boxed(Some(ProtectionKind::TamperProtection), &log)];
        assert_eq!(
            Pipeline::new(signing_only).unwrap().offered(),
            Protections::from(ProtectionKind::TamperProtection)
        );
    }

    #[test]
    fn missing_protection_is_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tamper = Recorder::boxed(Some(ProtectionKind::TamperProtection), &log);
        let pipeline = Pipeline::new(vec![tamper]).unwrap();
        let mut message = Sample {
            required: Protections::all(),
            ..Sample::default()
        };

        match pipeline.process_incoming(&mut message) {
            Err(ProtocolError::Unprotected { required, applied }) => {
                assert_eq!(required, Protections::all());
                assert_eq!(applied, Protections::from(ProtectionKind::TamperProtection));
            }
            other => panic!("Expected unprotected message, got {:?}", other),
        }
    }

    #[test]
    fn applying_twice_fails_only_when_sending() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let liar: Box<dyn BindingElement> = Box::new(Recorder {
            kind: None,
            applies: Some(ProtectionKind::TamperProtection),
            log: log.clone(),
        });
        let pipeline = Pipeline::new(vec![
            Recorder::boxed(Some(ProtectionKind::TamperProtection), &log),
            liar,
        ])
        .unwrap();

        let mut message = Sample::default();
        assert!(matches!(
            pipeline.process_outgoing(&mut message, |_| Ok(())),
            Err(ProtocolError::DuplicateProtection(ProtectionKind::TamperProtection))
        ));
        assert!(pipeline.process_incoming(&mut message).is_ok());
    }

    #[test]
    fn protection_sets() {
        let mut set = Protections::none();
        assert!(set.insert(ProtectionKind::Expiration));
        assert!(!set.insert(ProtectionKind::Expiration));
        assert!(set.covers(Protections::none()));
        assert!(!set.covers(Protections::all()));
        assert_eq!(set.to_string(), "expiration");
        assert_eq!(Protections::none().to_string(), "no protection");
        assert_eq!(
            Protections::all().iter().collect::<Vec<_>>(),
            ProtectionKind::ALL.to_vec()
        );
    }
}
