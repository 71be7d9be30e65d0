//! The direct endpoint of a provider.
//!
//! Relying parties post two kinds of requests to a provider: associate requests to establish a
//! shared secret, and check authentication requests to verify an assertion when they could not
//! associate. Assertions themselves are sent through the indirect channel built by
//! [`openid::channel`](../fn.channel.html), which signs them with the same association store.
use std::sync::Arc;

use url::Url;

use super::factory::{IncomingMessage, OpenIdFactory};
use super::messages::*;
use crate::channel::error::{ErrorKind, ProtocolError};
use crate::channel::signing::{verify_signature, PRIVATE_ASSOCIATIONS, SHARED_ASSOCIATIONS};
use crate::channel::{Channel, DirectResponse};
use crate::config::SecuritySettings;
use crate::message::query::QueryParameter;
use crate::message::{Message, ReplayProtected, Version};
use crate::primitives::association::{Association, AssociationKind, AssociationStore};
use crate::primitives::diffie_hellman::{DiffieHellman, SessionKind};
use crate::primitives::generator::RandomGenerator;
use crate::primitives::nonce::NonceStore;

/// The answer to an associate request.
#[derive(Debug)]
pub enum AssociateReply {
    /// A new association was established.
    Associated(AssociateSuccessfulResponse),

    /// The requested type is not acceptable, another one is suggested.
    Refused(AssociateUnsuccessfulResponse),

    /// No association is possible at all.
    Error(DirectErrorResponse),
}

impl AssociateReply {
    /// The reply as a message to be sent.
    pub fn message_mut(&mut self) -> &mut dyn Message {
        match self {
            AssociateReply::Associated(message) => message,
            AssociateReply::Refused(message) => message,
            AssociateReply::Error(message) => message,
        }
    }
}

/// Answers the direct requests of relying parties.
pub struct Provider {
    settings: SecuritySettings,
    associations: Arc<dyn AssociationStore>,
    confirmed: Box<dyn NonceStore>,
    random: RandomGenerator,
    channel: Channel<OpenIdFactory>,
}

impl Provider {
    /// A provider keeping associations in `associations`.
    ///
    /// The store must be the one the signing element of the indirect channel uses. The nonce
    /// store remembers which assertions were already confirmed to a relying party, so that each
    /// is confirmed only once.
    pub fn new(
        settings: &SecuritySettings,
        associations: Arc<dyn AssociationStore>,
        confirmed: Box<dyn NonceStore>,
    ) -> Result<Self, ProtocolError> {
        let channel = super::direct_channel(None)?;
        Ok(Provider {
            settings: settings.clone(),
            associations,
            confirmed,
            random: RandomGenerator::new(),
            channel,
        })
    }

    /// Read a direct request and produce the response body.
    ///
    /// `secure` states whether the request arrived over an encrypted transport, which is
    /// required for associations without Diffie-Hellman. Returns `Ok(None)` if the parameters are
    /// no direct request. Malformed requests are answered with an error response.
    pub fn handle_direct<Q>(
        &self,
        parameters: &Q,
        secure: bool,
    ) -> Result<Option<DirectResponse>, ProtocolError>
    where
        Q: QueryParameter + ?Sized,
    {
        let received = match self.channel.read_from_request(parameters) {
            Ok(Some(received)) => received,
            Ok(None) => return Ok(None),
            Err(err) if err.kind() == ErrorKind::Protocol => {
                warn!("Rejecting malformed direct request: {}", err);
                let version = match parameters.unique_value("openid.ns") {
                    None => Version::V11,
                    Some(_) => Version::V20,
                };
                let mut reply = DirectErrorResponse::new(version, err.to_string());
                return self.channel.prepare_direct_response(&mut reply).map(Some);
            }
            Err(err) => return Err(err),
        };

        match received {
            IncomingMessage::Associate(request) => {
                let mut reply = self.associate(&request, secure)?;
                self.channel.prepare_direct_response(reply.message_mut()).map(Some)
            }
            IncomingMessage::CheckAuthentication(request) => {
                let mut reply = self.check_authentication(&request)?;
                self.channel.prepare_direct_response(&mut reply).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Answer an associate request.
    pub fn associate(
        &self,
        request: &AssociateRequest,
        secure: bool,
    ) -> Result<AssociateReply, ProtocolError> {
        let kind = request
            .assoc_type
            .ok_or_else(|| ProtocolError::MissingRequiredField {
                message: "AssociateRequest",
                field: "openid.assoc_type".into(),
            })?;
        let session = request.session_kind();

        if let Some(reason) = self.refusal(kind, session, secure) {
            info!("Refusing {} association over {}: {}", kind, session, reason);
            return Ok(self.refuse(request.version, reason, secure));
        }

        let dh = if session.is_diffie_hellman() {
            Some(self.key_pair(request)?)
        } else {
            None
        };

        let association =
            Association::generate(kind, self.settings.association_lifetime, &self.random);
        let response = AssociateSuccessfulResponse::new(request, &association, dh.as_ref())?;
        self.associations.store(SHARED_ASSOCIATIONS, association.clone())?;

        info!("Established {} association {} over {}", kind, association.handle(), session);
        Ok(AssociateReply::Associated(response))
    }

    /// Answer a check authentication request.
    ///
    /// Only assertions signed with a private association can be confirmed, and each of them only
    /// once.
    pub fn check_authentication(
        &self, request: &CheckAuthenticationRequest,
    ) -> Result<CheckAuthenticationResponse, ProtocolError> {
        let mut assertion = request.assertion()?;
        let is_valid = self.confirm(&mut assertion)?;

        // Tell the relying party to drop a handle we no longer know.
        let invalidate_handle = match assertion.invalidate_handle.as_deref() {
            Some(handle) => match self.associations.get(SHARED_ASSOCIATIONS, Some(handle))? {
                Some(_) => None,
                None => Some(handle.to_string()),
            },
            None => None,
        };

        info!("Check authentication answered with is_valid:{}", is_valid);
        Ok(CheckAuthenticationResponse::new(request.version, is_valid, invalidate_handle))
    }

    fn confirm(&self, assertion: &mut PositiveAssertion) -> Result<bool, ProtocolError> {
        let handle = match assertion.assoc_handle.clone() {
            Some(handle) => handle,
            None => return Ok(false),
        };

        let association = match self.associations.get(PRIVATE_ASSOCIATIONS, Some(&handle))? {
            Some(association) => association,
            None => {
                debug!("No private association {} to confirm with", handle);
                return Ok(false);
            }
        };

        match verify_signature(&association, assertion) {
            Ok(true) => (),
            Ok(false) => return Ok(false),
            Err(err) if err.is_security_failure() => return Ok(false),
            Err(err) => return Err(err),
        }

        if assertion.version == Version::V11 {
            return Ok(true);
        }

        let context = assertion.nonce_context();
        match (assertion.nonce(), assertion.nonce_timestamp()) {
            (Some(nonce), Some(created)) => {
                let fresh = self.confirmed.store_nonce(context.as_deref(), nonce, created)?;
                if !fresh {
                    error!("Assertion with nonce {} was already confirmed", nonce);
                }
                Ok(fresh)
            }
            _ => Ok(false),
        }
    }

    fn refusal(&self, kind: AssociationKind, session: SessionKind, secure: bool) -> Option<String> {
        let bits = kind.hash_bits();
        if bits < self.settings.minimum_hash_bits || bits > self.settings.maximum_hash_bits {
            return Some(format!("{} is outside the accepted strength", kind));
        }

        if !session.is_compatible(kind) {
            return Some(format!("{} can not carry a {} secret", session, kind));
        }

        if !session.is_diffie_hellman() && !secure {
            return Some(format!("{} requires an encrypted transport", session));
        }

        None
    }

    fn refuse(&self, version: Version, reason: String, secure: bool) -> AssociateReply {
        let best =
            AssociationKind::best(self.settings.minimum_hash_bits, self.settings.maximum_hash_bits);
        match (version, best) {
            (Version::V20, Some(kind)) => {
                let session = if secure {
                    SessionKind::NoEncryption
                } else {
                    SessionKind::for_association(kind)
                };
                AssociateReply::Refused(AssociateUnsuccessfulResponse::new(
                    version,
                    reason,
                    Some((kind, session)),
                ))
            }
            _ => AssociateReply::Error(DirectErrorResponse::new(version, reason)),
        }
    }

    fn key_pair(&self, request: &AssociateRequest) -> Result<DiffieHellman, ProtocolError> {
        match (&request.dh_modulus, &request.dh_gen) {
            (None, None) => Ok(DiffieHellman::new(&self.random)),
            (modulus, generator) => {
                let default = DiffieHellman::new(&self.random);
                let modulus = modulus.clone().unwrap_or_else(|| default.modulus().clone());
                let generator = generator.clone().unwrap_or_else(|| default.generator().clone());
                DiffieHellman::with_parameters(modulus, generator, &self.random)
            }
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("settings", &self.settings)
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::channel::binding::BindingElement;
    use crate::channel::signing::SigningElement;
    use crate::message::Expiring;
    use crate::primitives::association::AssociationMap;
    use crate::primitives::nonce::NonceMap;

    fn provider(store: Arc<AssociationMap>) -> Provider {
        let settings = SecuritySettings::default();
        let confirmed = Box::new(NonceMap::new(settings.maximum_message_age()));
        Provider::new(&settings, store, confirmed).unwrap()
    }

    #[test]
    fn associates_over_diffie_hellman() {
        let store = Arc::new(AssociationMap::new());
        let provider = provider(store.clone());
        let random = RandomGenerator::new();
        let consumer = DiffieHellman::new(&random);
        let request = AssociateRequest::diffie_hellman(
            Version::V20,
            AssociationKind::HmacSha256,
            SessionKind::DhSha256,
            &consumer,
        );

        let response = match provider.associate(&request, false).unwrap() {
            AssociateReply::Associated(response) => response,
            other => panic!("Expected an association, got {:?}", other),
        };
        let association = response.association(Some(&consumer)).unwrap();
        let stored = store
            .get(SHARED_ASSOCIATIONS, Some(association.handle()))
            .unwrap()
            .unwrap();
        assert_eq!(stored.secret(), association.secret());
        assert!(stored.has_useful_life_remaining(Duration::days(13), Utc::now()));
    }

    #[test]
    fn refuses_unencrypted_over_plain_transport() {
        let provider = provider(Arc::new(AssociationMap::new()));
        let request = AssociateRequest::unencrypted(Version::V20, AssociationKind::HmacSha256);

        match provider.associate(&request, false).unwrap() {
            AssociateReply::Refused(refusal) => {
                assert_eq!(
                    refusal.suggestion(),
                    Some((AssociationKind::HmacSha256, SessionKind::DhSha256))
                );
            }
            other => panic!("Expected a refusal, got {:?}", other),
        }

        assert!(matches!(
            provider.associate(&request, true).unwrap(),
            AssociateReply::Associated(_)
        ));
    }

    #[test]
    fn refuses_incompatible_sessions() {
        let provider = provider(Arc::new(AssociationMap::new()));
        let random = RandomGenerator::new();
        let request = AssociateRequest::diffie_hellman(
            Version::V20,
            AssociationKind::HmacSha1,
            SessionKind::DhSha256,
            &DiffieHellman::new(&random),
        );
        assert!(matches!(
            provider.associate(&request, false).unwrap(),
            AssociateReply::Refused(_)
        ));

        let mut openid1 = request.clone();
        openid1.version = Version::V11;
        assert!(matches!(
            provider.associate(&openid1, false).unwrap(),
            AssociateReply::Error(_)
        ));
    }

    #[test]
    fn confirms_private_signatures_once() {
        let store = Arc::new(AssociationMap::new());
        let provider = provider(store.clone());
        let signer = SigningElement::provider(store, &SecuritySettings::default());

        let mut assertion = PositiveAssertion::new(
            Version::V20,
            Url::parse("https://op.example/server").unwrap(),
            Url::parse("https://rp.example/cb").unwrap(),
        );
        assertion.set_created(Utc::now());
        assertion.set_nonce("unique".into());
        signer.prepare_for_sending(&mut assertion).unwrap();

        let request = CheckAuthenticationRequest::from_assertion(&assertion);
        let first = provider.check_authentication(&request).unwrap();
        assert_eq!(first.is_valid, Some(true));
        let second = provider.check_authentication(&request).unwrap();
        assert_eq!(second.is_valid, Some(false));

        let mut forged = assertion.clone();
        forged.return_to = Url::parse("https://evil.example/cb").ok();
        forged.set_nonce("other".into());
        let request = CheckAuthenticationRequest::from_assertion(&forged);
        assert_eq!(provider.check_authentication(&request).unwrap().is_valid, Some(false));
    }

    #[test]
    fn direct_requests_produce_responses() {
        let provider = provider(Arc::new(AssociationMap::new()));
        let request = vec![
            ("openid.ns", crate::message::OPENID2_NAMESPACE),
            ("openid.mode", "associate"),
            ("openid.assoc_type", "HMAC-SHA256"),
            ("openid.session_type", "no-encryption"),
        ];
        let response = provider.handle_direct(&request, true).unwrap().unwrap();
        assert_eq!(response.status, 200);
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains("mac_key:"));

        let malformed = vec![("openid.mode", "associate"), ("openid.assoc_type", "HMAC-MD5")];
        let response = provider.handle_direct(&malformed, true).unwrap().unwrap();
        assert_eq!(response.status, 400);

        let unrelated = vec![("openid.mode", "checkid_setup")];
        assert!(provider.handle_direct(&unrelated, true).unwrap().is_none());
    }
}
