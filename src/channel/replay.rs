//! Rejects messages that have been received before.
use chrono::{Duration, Utc};

use super::binding::{BindingElement, ProtectionKind};
use super::error::ProtocolError;
use crate::message::Message;
use crate::primitives::generator::NonceGenerator;
use crate::primitives::nonce::NonceStore;

/// Attaches nonces to outgoing messages and remembers those of incoming messages.
pub struct ReplayElement {
    store: Box<dyn NonceStore>,
    generator: NonceGenerator,
    maximum_age: Duration,
}

impl ReplayElement {
    /// Remember nonces in the store, generate them with the generator.
    ///
    /// Messages older than `maximum_age` are rejected as expired before their nonce reaches the
    /// store, so the store only has to remember nonces for that long.
    pub fn new(
        store: Box<dyn NonceStore>,
        generator: NonceGenerator,
        maximum_age: Duration,
    ) -> Self {
        ReplayElement {
            store,
            generator,
            maximum_age,
        }
    }
}

impl BindingElement for ReplayElement {
    fn protection(&self) -> Option<ProtectionKind> {
        Some(ProtectionKind::ReplayProtection)
    }

    fn prepare_for_sending(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError> {
        match message.replay_protected() {
            Some(protected) => {
                protected.set_nonce(self.generator.generate());
                Ok(Some(ProtectionKind::ReplayProtection))
            }
            None => Ok(None),
        }
    }

    fn prepare_for_receiving(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError> {
        let (context, nonce, timestamp) = match message.replay_protected() {
            Some(protected) => (
                protected.nonce_context(),
                protected.nonce().map(str::to_string),
                protected.nonce_timestamp(),
            ),
            None => return Ok(None),
        };

        let (nonce, timestamp) = match (nonce, timestamp) {
            (Some(nonce), Some(timestamp)) if !nonce.is_empty() => (nonce, timestamp),
            _ => return Err(ProtocolError::InvalidNonce),
        };

        let now = Utc::now();
        match timestamp.checked_add_signed(self.maximum_age) {
            Some(expired) if expired < now => {
                let name = message.description().name();
                error!("Rejecting expired {} created at {}", name, timestamp);
                return Err(ProtocolError::ExpiredMessage { expired, now });
            }
            _ => (),
        }

        if !self.store.store_nonce(context.as_deref(), &nonce, timestamp)? {
            error!(
                "Replayed nonce {} in {} from {}",
                nonce,
                message.description().name(),
                context.as_deref().unwrap_or("unknown context")
            );
            return Err(ProtocolError::ReplayedMessage { nonce });
        }

        Ok(Some(ProtectionKind::ReplayProtection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    use crate::message::{Expiring, ReplayProtected, Version};
    use crate::openid::messages::PositiveAssertion;
    use crate::primitives::nonce::NonceMap;

    fn element() -> ReplayElement {
        ReplayElement::new(
            Box::new(NonceMap::new(Duration::minutes(23))),
            NonceGenerator::new(8),
            Duration::minutes(23),
        )
    }

    fn assertion() -> PositiveAssertion {
        let mut message = PositiveAssertion::new(
            Version::V20,
            Url::parse("https://op.example/server").unwrap(),
            Url::parse("https://rp.example/cb").unwrap(),
        );
        message.set_created(Utc::now());
        message
    }

    #[test]
    fn attaches_nonce() {
        let mut message = assertion();
        let element = element();
        element.prepare_for_sending(&mut message).unwrap();
        let nonce = message.nonce().unwrap().to_string();
        assert_eq!(nonce.len(), 8);

        let mut other = assertion();
        element.prepare_for_sending(&mut other).unwrap();
        assert_ne!(other.nonce().unwrap(), nonce);
    }

    #[test]
    fn second_receipt_is_a_replay() {
        let sender = element();
        let receiver = element();
        let mut message = assertion();
        sender.prepare_for_sending(&mut message).unwrap();

        assert_eq!(
            receiver.prepare_for_receiving(&mut message).unwrap(),
            Some(ProtectionKind::ReplayProtection)
        );
        match receiver.prepare_for_receiving(&mut message) {
            Err(err @ ProtocolError::ReplayedMessage { .. }) => assert!(err.is_security_failure()),
            other => panic!("Expected replay, got {:?}", other),
        }
    }

    #[test]
    fn missing_nonce_is_invalid() {
        let mut message = assertion();
        assert!(matches!(
            element().prepare_for_receiving(&mut message),
            Err(ProtocolError::InvalidNonce)
        ));
    }

    #[test]
    fn stale_nonce_is_expired() {
        let sender = element();
        let receiver = element();
        let mut message = assertion();
        sender.prepare_for_sending(&mut message).unwrap();
        message.set_created(Utc::now() - Duration::minutes(23) - Duration::seconds(1));

        match receiver.prepare_for_receiving(&mut message) {
            Err(err @ ProtocolError::ExpiredMessage { .. }) => assert!(err.is_security_failure()),
            other => panic!("Expected expiration, got {:?}", other),
        }
    }
}
