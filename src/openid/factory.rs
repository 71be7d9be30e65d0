//! Recognizes OpenID messages from their parameters.
use crate::channel::binding::Protections;
use crate::channel::error::ProtocolError;
use crate::message::factory::{MessageFactory, Recognizer, RecognizerChain};
use crate::message::query::{NormalizedParameter, QueryParameter};
use crate::message::{Message, ReceivedMessage, Version};

use super::messages::*;

/// Every mode an OpenID request may carry.
const KNOWN_MODES: &[&str] = &[
    "associate",
    "checkid_setup",
    "checkid_immediate",
    "id_res",
    "setup_needed",
    "cancel",
    "check_authentication",
    "error",
];

/// The concrete message types a request can be decoded into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `associate`
    Associate,
    /// `checkid_setup` or `checkid_immediate`
    CheckId,
    /// `id_res` with an identity or return url
    PositiveAssertion,
    /// `cancel` or `setup_needed`
    NegativeAssertion,
    /// `check_authentication`
    CheckAuthentication,
    /// `error`
    IndirectError,
}

/// A message read by an OpenID channel.
///
/// Every variant has passed the binding elements of the channel that produced it.
#[derive(Debug)]
pub enum IncomingMessage {
    /// A relying party asks for an association.
    Associate(AssociateRequest),
    /// A relying party asks to authenticate the user.
    CheckId(CheckIdRequest),
    /// A provider asserts an identity.
    PositiveAssertion(PositiveAssertion),
    /// A provider declines to assert an identity.
    NegativeAssertion(NegativeAssertion),
    /// A relying party asks whether an assertion is authentic.
    CheckAuthentication(CheckAuthenticationRequest),
    /// An error reported through the user agent.
    IndirectError(IndirectErrorResponse),
    /// A provider established an association.
    Associated(AssociateSuccessfulResponse),
    /// A provider refused the association type.
    AssociationRefused(AssociateUnsuccessfulResponse),
    /// A provider verified an assertion.
    Verified(CheckAuthenticationResponse),
    /// An error answering a direct request.
    DirectError(DirectErrorResponse),
}

impl IncomingMessage {
    fn empty(kind: MessageKind, version: Version) -> Self {
        match kind {
            MessageKind::Associate => IncomingMessage::Associate(AssociateRequest::empty(version)),
            MessageKind::CheckId => IncomingMessage::CheckId(CheckIdRequest::empty(version)),
            MessageKind::PositiveAssertion => {
                IncomingMessage::PositiveAssertion(PositiveAssertion::empty(version))
            }
            MessageKind::NegativeAssertion => {
                IncomingMessage::NegativeAssertion(NegativeAssertion::empty(version))
            }
            MessageKind::CheckAuthentication => {
                IncomingMessage::CheckAuthentication(CheckAuthenticationRequest::empty(version))
            }
            MessageKind::IndirectError => {
                IncomingMessage::IndirectError(IndirectErrorResponse::empty(version))
            }
        }
    }
}

impl ReceivedMessage for IncomingMessage {
    fn message(&self) -> &dyn Message {
        match self {
            IncomingMessage::Associate(message) => message,
            IncomingMessage::CheckId(message) => message,
            IncomingMessage::PositiveAssertion(message) => message,
            IncomingMessage::NegativeAssertion(message) => message,
            IncomingMessage::CheckAuthentication(message) => message,
            IncomingMessage::IndirectError(message) => message,
            IncomingMessage::Associated(message) => message,
            IncomingMessage::AssociationRefused(message) => message,
            IncomingMessage::Verified(message) => message,
            IncomingMessage::DirectError(message) => message,
        }
    }

    fn message_mut(&mut self) -> &mut dyn Message {
        match self {
            IncomingMessage::Associate(message) => message,
            IncomingMessage::CheckId(message) => message,
            IncomingMessage::PositiveAssertion(message) => message,
            IncomingMessage::NegativeAssertion(message) => message,
            IncomingMessage::CheckAuthentication(message) => message,
            IncomingMessage::IndirectError(message) => message,
            IncomingMessage::Associated(message) => message,
            IncomingMessage::AssociationRefused(message) => message,
            IncomingMessage::Verified(message) => message,
            IncomingMessage::DirectError(message) => message,
        }
    }
}

/// Creates OpenID messages for a channel.
pub struct OpenIdFactory {
    requests: RecognizerChain<MessageKind>,
}

impl OpenIdFactory {
    /// Recognize every OpenID message.
    pub fn new() -> Self {
        let requests = RecognizerChain::new()
            .then_value(Recognizer::value(MessageKind::Associate, "openid.mode", "associate"))
            .then_value(Recognizer::value(MessageKind::CheckId, "openid.mode", "checkid_setup"))
            .then_value(Recognizer::value(MessageKind::CheckId, "openid.mode", "checkid_immediate"))
            .then(Recognizer::new(MessageKind::NegativeAssertion, is_negative_assertion))
            .then(Recognizer::new(MessageKind::PositiveAssertion, is_positive_assertion))
            .then_value(Recognizer::value(
                MessageKind::CheckAuthentication,
                "openid.mode",
                "check_authentication",
            ))
            .then_value(Recognizer::value(MessageKind::IndirectError, "openid.mode", "error"));

        OpenIdFactory { requests }
    }

    /// Recognize only the direct requests a provider answers, which need no protection.
    pub fn direct() -> Self {
        let requests = RecognizerChain::new()
            .then_value(Recognizer::value(MessageKind::Associate, "openid.mode", "associate"))
            .then_value(Recognizer::value(
                MessageKind::CheckAuthentication,
                "openid.mode",
                "check_authentication",
            ));

        OpenIdFactory { requests }
    }
}

impl Default for OpenIdFactory {
    fn default() -> Self {
        OpenIdFactory::new()
    }
}

impl MessageFactory for OpenIdFactory {
    type Output = IncomingMessage;

    fn protection_requirements(&self) -> Vec<(&'static str, Protections)> {
        self.requests
            .kinds()
            .into_iter()
            .map(|kind| match kind {
                MessageKind::PositiveAssertion => ("PositiveAssertion", Protections::all()),
                MessageKind::Associate => ("AssociateRequest", Protections::none()),
                MessageKind::CheckId => ("CheckIdRequest", Protections::none()),
                MessageKind::NegativeAssertion => ("NegativeAssertion", Protections::none()),
                MessageKind::CheckAuthentication => {
                    ("CheckAuthenticationRequest", Protections::none())
                }
                MessageKind::IndirectError => ("IndirectErrorResponse", Protections::none()),
            })
            .collect()
    }

    fn recognize_request(
        &self,
        fields: &NormalizedParameter,
    ) -> Result<Option<IncomingMessage>, ProtocolError> {
        let mode = match fields.unique_value("openid.mode") {
            Some(mode) => mode.into_owned(),
            None => return Ok(None),
        };

        let version = Version::from_namespace(fields.unique_value("openid.ns").as_deref())?;
        match self.requests.recognize(fields) {
            Some(kind) => Ok(Some(IncomingMessage::empty(kind, version))),
            None if KNOWN_MODES.contains(&mode.as_str()) => Ok(None),
            None => Err(ProtocolError::InvalidFieldValue {
                field: "openid.mode".into(),
                reason: format!("unknown mode {:?}", mode),
            }),
        }
    }

    fn recognize_response(
        &self, request: &dyn Message, fields: &NormalizedParameter,
    ) -> Result<Option<IncomingMessage>, ProtocolError> {
        let version = Version::from_namespace(fields.unique_value("ns").as_deref())?;
        let is_error = fields.contains_key("error");
        let any = request.as_any();

        if any.is::<AssociateRequest>() {
            if version == Version::V20 && fields.contains_key("error_code") {
                return Ok(Some(IncomingMessage::AssociationRefused(
                    AssociateUnsuccessfulResponse::empty(version),
                )));
            }

            if !is_error {
                return Ok(Some(IncomingMessage::Associated(AssociateSuccessfulResponse::empty(
                    version,
                ))));
            }
        }

        if any.is::<CheckAuthenticationRequest>() && !is_error {
            return Ok(Some(IncomingMessage::Verified(CheckAuthenticationResponse::empty(
                version,
            ))));
        }

        if is_error {
            return Ok(Some(IncomingMessage::DirectError(DirectErrorResponse::empty(version))));
        }

        Ok(None)
    }
}

fn mode(fields: &NormalizedParameter) -> Option<String> {
    fields.unique_value("openid.mode").map(|mode| mode.into_owned())
}

/// `cancel`, `setup_needed` in 2.0, or `id_res` with a setup url in 1.1.
fn is_negative_assertion(fields: &NormalizedParameter) -> bool {
    let openid2 = fields.contains_key("openid.ns");
    match mode(fields).as_deref() {
        Some("cancel") => true,
        Some("setup_needed") => openid2 || fields.contains_key("openid.user_setup_url"),
        Some("id_res") => !openid2 && fields.contains_key("openid.user_setup_url"),
        _ => false,
    }
}

fn is_positive_assertion(fields: &NormalizedParameter) -> bool {
    mode(fields).as_deref() == Some("id_res")
}
