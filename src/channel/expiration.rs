//! Rejects messages that are too old.
use chrono::{Duration, Utc};

use super::binding::{BindingElement, ProtectionKind};
use super::error::ProtocolError;
use crate::config::SecuritySettings;
use crate::message::Message;

/// Stamps outgoing messages with their creation time and rejects stale incoming ones.
#[derive(Clone, Copy, Debug)]
pub struct ExpirationElement {
    maximum_age: Duration,
    maximum_clock_skew: Duration,
}

impl ExpirationElement {
    /// Accept messages up to `maximum_age` old.
    ///
    /// The age should already include twice the clock skew expected between the hosts. Messages
    /// claiming a creation time more than `maximum_clock_skew` in the future are rejected.
    pub fn new(maximum_age: Duration, maximum_clock_skew: Duration) -> Self {
        ExpirationElement {
            maximum_age,
            maximum_clock_skew,
        }
    }

    /// Use the maximum message age and clock skew of the settings.
    pub fn from_settings(settings: &SecuritySettings) -> Self {
        ExpirationElement::new(settings.maximum_message_age(), settings.maximum_clock_skew)
    }

    /// The maximum accepted age.
    pub fn maximum_age(&self) -> Duration {
        self.maximum_age
    }
}

impl BindingElement for ExpirationElement {
    fn protection(&self) -> Option<ProtectionKind> {
        Some(ProtectionKind::Expiration)
    }

    fn prepare_for_sending(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError> {
        match message.expiring() {
            Some(expiring) => {
                expiring.set_created(Utc::now());
                Ok(Some(ProtectionKind::Expiration))
            }
            None => Ok(None),
        }
    }

    fn prepare_for_receiving(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError> {
        let name = message.description().name();
        let created = match message.expiring() {
            Some(expiring) => expiring.created(),
            None => return Ok(None),
        };

        let created = created.ok_or_else(|| ProtocolError::MissingRequiredField {
            message: name,
            field: "creation time".into(),
        })?;

        let now = Utc::now();
        let expired = created + self.maximum_age;
        if expired < now {
            error!("Rejecting expired {} created at {}", name, created);
            return Err(ProtocolError::ExpiredMessage { expired, now });
        }

        if created > now + self.maximum_clock_skew {
            error!("Rejecting {} created in the future at {}", name, created);
            return Err(ProtocolError::FutureTimestamp { created });
        }

        Ok(Some(ProtectionKind::Expiration))
    }
}
