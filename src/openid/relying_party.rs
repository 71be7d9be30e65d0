//! The relying party side of the direct messages.
//!
//! A relying party first tries to share an association with the provider, so it can verify
//! assertions locally. When that is impossible it falls back to dumb mode, asking the provider
//! about each assertion with a check authentication request.
use std::sync::Arc;

use chrono::Utc;
use url::Url;

use super::factory::{IncomingMessage, OpenIdFactory};
use super::messages::*;
use crate::channel::error::ProtocolError;
use crate::channel::http::HttpFetcher;
use crate::channel::signing::{DirectVerifier, Verification};
use crate::channel::Channel;
use crate::config::SecuritySettings;
use crate::message::Version;
use crate::primitives::association::{Association, AssociationKind, AssociationStore};
use crate::primitives::diffie_hellman::{DiffieHellman, SessionKind};
use crate::primitives::generator::RandomGenerator;

/// Establishes and caches associations with providers.
///
/// Associations are stored under the provider endpoint url, which is where the signing element of
/// a relying party channel looks for them.
pub struct AssociationManager {
    settings: SecuritySettings,
    associations: Arc<dyn AssociationStore>,
    channel: Channel<OpenIdFactory>,
    random: RandomGenerator,
}

impl AssociationManager {
    /// A manager posting associate requests through `fetcher`.
    pub fn new(
        settings: &SecuritySettings,
        associations: Arc<dyn AssociationStore>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Result<Self, ProtocolError> {
        Ok(AssociationManager {
            settings: settings.clone(),
            associations,
            channel: super::direct_channel(Some(fetcher))?,
            random: RandomGenerator::new(),
        })
    }

    /// Find a usable association with the provider or create a new one.
    ///
    /// Returns `Ok(None)` when the provider does not associate with us and dumb mode is allowed.
    /// Failing to reach the provider is an error, so the caller can decide to retry.
    pub fn get_or_create(
        &self,
        provider: &Url,
        version: Version,
    ) -> Result<Option<Association>, ProtocolError> {
        let key = provider.as_str();
        if let Some(existing) = self.associations.get(key, None)? {
            let minimum = self.settings.minimum_useful_association_lifetime;
            if existing.has_useful_life_remaining(minimum, Utc::now()) {
                return Ok(Some(existing));
            }
        }

        let best =
            AssociationKind::best(self.settings.minimum_hash_bits, self.settings.maximum_hash_bits);
        let created = match best {
            Some(kind) => {
                let session = if version == Version::V20 && provider.scheme() == "https" {
                    SessionKind::NoEncryption
                } else {
                    SessionKind::for_association(kind)
                };
                self.associate(provider, version, kind, session, true)?
            }
            None => {
                warn!("No association type satisfies the configured hash strength");
                None
            }
        };

        match created {
            Some(association) => {
                self.associations.store(key, association.clone())?;
                info!("Associated with {} as {}", provider, association.handle());
                Ok(Some(association))
            }
            None if self.settings.allow_dumb_mode => {
                info!("Continuing with {} in dumb mode", provider);
                Ok(None)
            }
            None => Err(ProtocolError::Configuration(format!(
                "no association with {} and dumb mode is disabled",
                provider
            ))),
        }
    }

    fn associate(
        &self,
        provider: &Url,
        version: Version,
        kind: AssociationKind,
        session: SessionKind,
        retry: bool,
    ) -> Result<Option<Association>, ProtocolError> {
        let dh = if session.is_diffie_hellman() {
            Some(DiffieHellman::new(&self.random))
        } else {
            None
        };

        let mut request = match &dh {
            Some(dh) => AssociateRequest::diffie_hellman(version, kind, session, dh),
            None => AssociateRequest::unencrypted(version, kind),
        };

        debug!("Requesting {} association over {} from {}", kind, session, provider);
        let response = match self.channel.request(&mut request, provider) {
            Ok(response) => response,
            Err(err @ ProtocolError::Transport(_)) => return Err(err),
            Err(err) => {
                warn!("Association with {} failed: {}", provider, err);
                return Ok(None);
            }
        };

        match response {
            IncomingMessage::Associated(response) if response.session_kind() != session => {
                warn!(
                    "Provider {} answered a {} request with {}",
                    provider,
                    session,
                    response.session_kind()
                );
                Ok(None)
            }
            IncomingMessage::Associated(response) => match response.association(dh.as_ref()) {
                Ok(association) => Ok(Some(association)),
                Err(err) => {
                    warn!("Unusable association from {}: {}", provider, err);
                    Ok(None)
                }
            },
            IncomingMessage::AssociationRefused(refusal) => match refusal.suggestion() {
                Some(suggested) if retry && suggested != (kind, session) => {
                    let (kind, session) = suggested;
                    if self.acceptable(provider, kind, session) {
                        debug!("Retrying with the suggested {} over {}", kind, session);
                        self.associate(provider, version, kind, session, false)
                    } else {
                        warn!("Suggested {} over {} is not acceptable", kind, session);
                        Ok(None)
                    }
                }
                _ => {
                    warn!("Provider {} refused to associate", provider);
                    Ok(None)
                }
            },
            IncomingMessage::DirectError(error) => {
                warn!(
                    "Provider {} refused to associate: {}",
                    provider,
                    error.error.as_deref().unwrap_or("")
                );
                Ok(None)
            }
            other => {
                warn!("Unexpected answer to an associate request: {:?}", other);
                Ok(None)
            }
        }
    }

    fn acceptable(&self, provider: &Url, kind: AssociationKind, session: SessionKind) -> bool {
        kind.hash_bits() >= self.settings.minimum_hash_bits
            && kind.hash_bits() <= self.settings.maximum_hash_bits
            && session.is_compatible(kind)
            && (session.is_diffie_hellman() || provider.scheme() == "https")
    }
}

impl std::fmt::Debug for AssociationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("AssociationManager")
            .field("settings", &self.settings)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Verifies assertions by asking the provider that issued them.
#[derive(Debug)]
pub struct HttpVerifier {
    channel: Channel<OpenIdFactory>,
}

impl HttpVerifier {
    /// A verifier posting check authentication requests through `fetcher`.
    pub fn new(fetcher: Arc<dyn HttpFetcher>) -> Result<Self, ProtocolError> {
        Ok(HttpVerifier {
            channel: super::direct_channel(Some(fetcher))?,
        })
    }
}

impl DirectVerifier for HttpVerifier {
    fn verify(
        &self,
        endpoint: &Url,
        fields: &[(String, String)],
    ) -> Result<Verification, ProtocolError> {
        let ns = fields
            .iter()
            .find(|(key, _)| key == "openid.ns")
            .map(|(_, value)| value.as_str());
        let version = Version::from_namespace(ns)?;

        let mut request = CheckAuthenticationRequest::new(version, fields.iter().cloned());
        match self.channel.request(&mut request, endpoint)? {
            IncomingMessage::Verified(response) => Ok(Verification {
                is_valid: response.is_valid.unwrap_or(false),
                invalidate_handle: response.invalidate_handle,
            }),
            IncomingMessage::DirectError(error) => Err(ProtocolError::ErrorResponse(
                error.error.unwrap_or_default(),
            )),
            other => Err(ProtocolError::Malformed(format!(
                "unexpected answer to check authentication: {:?}",
                other
            ))),
        }
    }
}
