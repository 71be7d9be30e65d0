//! The OpenID 2.0 message set and the flows built on it.
//!
//! Both parties use the same channel layout for indirect messages: expiration, replay protection
//! and signing, in that order. They differ only in the signing role. The provider signs with its
//! shared or private associations, the relying party verifies with the associations it established
//! through [`relying_party::AssociationManager`] or, lacking one, asks the provider directly.
//!
//! Direct messages (associate and check authentication) are protected by the transport alone and
//! use a channel without binding elements.
use std::sync::Arc;

pub mod factory;
pub mod messages;
pub mod provider;
pub mod relying_party;

use self::factory::OpenIdFactory;
use crate::channel::binding::BindingElement;
use crate::channel::error::ProtocolError;
use crate::channel::expiration::ExpirationElement;
use crate::channel::http::HttpFetcher;
use crate::channel::replay::ReplayElement;
use crate::channel::signing::{DirectVerifier, Role, SigningElement};
use crate::channel::Channel;
use crate::config::SecuritySettings;
use crate::primitives::association::AssociationStore;
use crate::primitives::nonce::NonceStore;

/// Build the channel for indirect messages.
///
/// The association store is shared with the direct endpoint: a provider must pass the store its
/// [`provider::Provider`] uses, a relying party the one of its association manager. The verifier
/// is only used by relying parties, to check assertions signed with associations they do not
/// know.
pub fn channel(
    role: Role,
    settings: &SecuritySettings,
    associations: Arc<dyn AssociationStore>,
    nonces: Box<dyn NonceStore>,
    verifier: Option<Box<dyn DirectVerifier>>,
) -> Result<Channel<OpenIdFactory>, ProtocolError> {
    let signing = match role {
        Role::Provider => {
            if verifier.is_some() {
                warn!("Ignoring the direct verifier of a provider channel");
            }
            SigningElement::provider(associations, settings)
        }
        Role::RelyingParty => SigningElement::relying_party(associations, verifier),
    };

    let elements: Vec<Box<dyn BindingElement>> = vec![
        Box::new(ExpirationElement::from_settings(settings)),
        Box::new(ReplayElement::new(
            nonces,
            settings.nonce_generator(),
            settings.maximum_message_age(),
        )),
        Box::new(signing),
    ];

    Ok(Channel::new(OpenIdFactory::new(), elements)?
        .with_get_to_post_threshold(settings.indirect_get_to_post_threshold))
}

/// Build a channel for direct messages.
///
/// Only a channel sending requests needs a fetcher.
pub fn direct_channel(
    fetcher: Option<Arc<dyn HttpFetcher>>,
) -> Result<Channel<OpenIdFactory>, ProtocolError> {
    let channel = Channel::new(OpenIdFactory::direct(), Vec::new())?;
    Ok(match fetcher {
        Some(fetcher) => channel.with_fetcher(fetcher),
        None => channel,
    })
}
