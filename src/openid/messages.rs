//! The OpenID 2.0 message set, with OpenID 1.1 compatibility.
//!
//! Indirect messages and direct requests prefix their parameters with `openid.`, direct responses
//! use bare names. The version of a message follows from its namespace parameter: a message
//! without one is OpenID 1.1.
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use url::Url;

use crate::channel::binding::{ProtectionKind, Protections};
use crate::channel::error::ProtocolError;
use crate::message::description::WireValue;
use crate::message::dictionary::{pairs, MessageDictionary};
use crate::message::{
    Expiring, ExtraData, Field, Message, MessageDescription, ReplayProtected, Signed, Transport,
    Version,
};
use crate::primitives::association::{Association, AssociationKind};
use crate::primitives::diffie_hellman::{DiffieHellman, SessionKind};
use crate::primitives::Time;

/// The claimed identifier asking the provider to let the user pick an identity.
pub const IDENTIFIER_SELECT: &str = "http://specs.openid.net/auth/2.0/identifier_select";

/// The only error code with a dedicated associate response.
pub const UNSUPPORTED_TYPE: &str = "unsupported-type";

/// Asks a provider to establish a shared secret.
#[derive(Clone, Debug)]
pub struct AssociateRequest {
    /// The protocol version.
    pub version: Version,

    /// The requested association type.
    pub assoc_type: Option<AssociationKind>,

    /// How the secret should be protected. Absent means no encryption in OpenID 1.1.
    pub session_type: Option<SessionKind>,

    /// The modulus, if not the default one.
    pub dh_modulus: Option<BigUint>,

    /// The generator, if not the default one.
    pub dh_gen: Option<BigUint>,

    /// The public Diffie-Hellman value of the relying party.
    pub dh_consumer_public: Option<BigUint>,

    extra: ExtraData,
}

static ASSOCIATE_REQUEST: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<AssociateRequest>("AssociateRequest")
        .computed(
            "openid.ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .constant("openid.mode", Field::required(), "associate")
        .field("openid.assoc_type", Field::required(), |m| &m.assoc_type, |m| &mut m.assoc_type)
        .field(
            "openid.session_type",
            Field::optional(),
            |m| &m.session_type,
            |m| &mut m.session_type,
        )
        .field("openid.dh_modulus", Field::optional(), |m| &m.dh_modulus, |m| &mut m.dh_modulus)
        .field("openid.dh_gen", Field::optional(), |m| &m.dh_gen, |m| &mut m.dh_gen)
        .field(
            "openid.dh_consumer_public",
            Field::optional(),
            |m| &m.dh_consumer_public,
            |m| &mut m.dh_consumer_public,
        )
        .build()
});

impl AssociateRequest {
    /// Request an association whose secret is sent in the clear.
    ///
    /// Only use this over an encrypted transport.
    pub fn unencrypted(version: Version, kind: AssociationKind) -> Self {
        AssociateRequest {
            assoc_type: Some(kind),
            session_type: Some(SessionKind::NoEncryption),
            ..AssociateRequest::empty(version)
        }
    }

    /// Request an association whose secret is masked through the key agreement.
    pub fn diffie_hellman(
        version: Version,
        kind: AssociationKind,
        session: SessionKind,
        dh: &DiffieHellman,
    ) -> Self {
        let (dh_modulus, dh_gen) = if dh.uses_default_parameters() {
            (None, None)
        } else {
            (Some(dh.modulus().clone()), Some(dh.generator().clone()))
        };

        AssociateRequest {
            assoc_type: Some(kind),
            session_type: Some(session),
            dh_modulus,
            dh_gen,
            dh_consumer_public: Some(dh.public_key().clone()),
            ..AssociateRequest::empty(version)
        }
    }

    pub(crate) fn empty(version: Version) -> Self {
        AssociateRequest {
            version,
            assoc_type: None,
            session_type: None,
            dh_modulus: None,
            dh_gen: None,
            dh_consumer_public: None,
            extra: ExtraData::new(),
        }
    }

    /// The requested session type.
    pub fn session_kind(&self) -> SessionKind {
        self.session_type.unwrap_or(SessionKind::NoEncryption)
    }
}

impl Message for AssociateRequest {
    fn description(&self) -> &'static MessageDescription {
        &ASSOCIATE_REQUEST
    }

    fn version(&self) -> Version {
        self.version
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

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.version == Version::V20 && self.session_type.is_none() {
            return Err(missing("AssociateRequest", "openid.session_type"));
        }

        if self.session_kind().is_diffie_hellman() && self.dh_consumer_public.is_none() {
            return Err(missing("AssociateRequest", "openid.dh_consumer_public"));
        }

        Ok(())
    }
}

/// A new association, as answered by the provider.
#[derive(Clone, Debug)]
pub struct AssociateSuccessfulResponse {
    /// The protocol version.
    pub version: Version,

    /// The association type.
    pub assoc_type: Option<AssociationKind>,

    /// How the secret is protected.
    pub session_type: Option<SessionKind>,

    /// The handle of the new association.
    pub assoc_handle: Option<String>,

    /// The lifetime of the association.
    pub expires_in: Option<Duration>,

    /// The secret in the clear, for unencrypted sessions.
    pub mac_key: Option<Vec<u8>>,

    /// The public Diffie-Hellman value of the provider.
    pub dh_server_public: Option<BigUint>,

    /// The masked secret, for Diffie-Hellman sessions.
    pub enc_mac_key: Option<Vec<u8>>,

    extra: ExtraData,
}

static ASSOCIATE_SUCCESSFUL_RESPONSE: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<AssociateSuccessfulResponse>("AssociateSuccessfulResponse")
        .computed(
            "ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .field("assoc_type", Field::required(), |m| &m.assoc_type, |m| &mut m.assoc_type)
        .field("session_type", Field::optional(), |m| &m.session_type, |m| &mut m.session_type)
        .field("assoc_handle", Field::required(), |m| &m.assoc_handle, |m| &mut m.assoc_handle)
        .field("expires_in", Field::required(), |m| &m.expires_in, |m| &mut m.expires_in)
        .field("mac_key", Field::optional(), |m| &m.mac_key, |m| &mut m.mac_key)
        .field(
            "dh_server_public",
            Field::optional(),
            |m| &m.dh_server_public,
            |m| &mut m.dh_server_public,
        )
        .field("enc_mac_key", Field::optional(), |m| &m.enc_mac_key, |m| &mut m.enc_mac_key)
        .build()
});

impl AssociateSuccessfulResponse {
    /// Answer a request with an association.
    ///
    /// The secret is masked when the request asked for a Diffie-Hellman session, in which case
    /// `dh` is the key pair of the provider over the parameters of the request.
    pub fn new(
        request: &AssociateRequest, association: &Association, dh: Option<&DiffieHellman>,
    ) -> Result<Self, ProtocolError> {
        let session = request.session_kind();
        let mut response = AssociateSuccessfulResponse {
            assoc_type: Some(association.kind()),
            session_type: request.session_type,
            assoc_handle: Some(association.handle().to_string()),
            expires_in: Some(association.lifetime()),
            ..AssociateSuccessfulResponse::empty(request.version)
        };

        if session.is_diffie_hellman() {
            let dh = dh
                .ok_or_else(|| ProtocolError::Configuration("no key pair for the session".into()))?;
            let consumer_public = request
                .dh_consumer_public
                .as_ref()
                .ok_or_else(|| missing("AssociateRequest", "openid.dh_consumer_public"))?;
            let masked = dh.xor_secret(session, consumer_public, association.secret())?;
            response.enc_mac_key = Some(masked);
            response.dh_server_public = Some(dh.public_key().clone());
        } else {
            response.mac_key = Some(association.secret().to_vec());
        }

        Ok(response)
    }

    pub(crate) fn empty(version: Version) -> Self {
        AssociateSuccessfulResponse {
            version,
            assoc_type: None,
            session_type: None,
            assoc_handle: None,
            expires_in: None,
            mac_key: None,
            dh_server_public: None,
            enc_mac_key: None,
            extra: ExtraData::new(),
        }
    }

    /// The session type of the response.
    pub fn session_kind(&self) -> SessionKind {
        self.session_type.unwrap_or(SessionKind::NoEncryption)
    }

    /// Recover the association, unmasking the secret with the key pair of the request.
    pub fn association(&self, dh: Option<&DiffieHellman>) -> Result<Association, ProtocolError> {
        let name = "AssociateSuccessfulResponse";
        let kind = self.assoc_type.ok_or_else(|| missing(name, "assoc_type"))?;
        let handle = self.assoc_handle.clone().ok_or_else(|| missing(name, "assoc_handle"))?;
        let lifetime = self.expires_in.ok_or_else(|| missing(name, "expires_in"))?;

        let session = self.session_kind();
        let secret = if session.is_diffie_hellman() {
            let dh = dh.ok_or_else(|| {
                ProtocolError::Configuration(
                    "a Diffie-Hellman response needs the key pair of the request".into(),
                )
            })?;
            let server_public = self
                .dh_server_public
                .as_ref()
                .ok_or_else(|| missing(name, "dh_server_public"))?;
            let masked = self.enc_mac_key.as_ref().ok_or_else(|| missing(name, "enc_mac_key"))?;
            dh.xor_secret(session, server_public, masked)?
        } else {
            self.mac_key.clone().ok_or_else(|| missing(name, "mac_key"))?
        };

        Association::new(kind, handle, secret, Utc::now(), lifetime)
    }
}

impl Message for AssociateSuccessfulResponse {
    fn description(&self) -> &'static MessageDescription {
        &ASSOCIATE_SUCCESSFUL_RESPONSE
    }

    fn version(&self) -> Version {
        self.version
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

    fn validate(&self) -> Result<(), ProtocolError> {
        let name = "AssociateSuccessfulResponse";
        if self.session_kind().is_diffie_hellman() {
            if self.dh_server_public.is_none() {
                return Err(missing(name, "dh_server_public"));
            }
            if self.enc_mac_key.is_none() {
                return Err(missing(name, "enc_mac_key"));
            }
        } else if self.mac_key.is_none() {
            return Err(missing(name, "mac_key"));
        }

        Ok(())
    }
}

/// The provider refuses the requested association type but suggests another.
#[derive(Clone, Debug)]
pub struct AssociateUnsuccessfulResponse {
    /// The protocol version.
    pub version: Version,

    /// A human readable reason.
    pub error: Option<String>,

    /// The association type the provider would accept.
    pub assoc_type: Option<AssociationKind>,

    /// The session type the provider would accept.
    pub session_type: Option<SessionKind>,

    extra: ExtraData,
}

static ASSOCIATE_UNSUCCESSFUL_RESPONSE: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<AssociateUnsuccessfulResponse>("AssociateUnsuccessfulResponse")
        .computed(
            "ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .field("error", Field::required(), |m| &m.error, |m| &mut m.error)
        .constant("error_code", Field::required(), UNSUPPORTED_TYPE)
        .field("assoc_type", Field::optional(), |m| &m.assoc_type, |m| &mut m.assoc_type)
        .field("session_type", Field::optional(), |m| &m.session_type, |m| &mut m.session_type)
        .build()
});

impl AssociateUnsuccessfulResponse {
    /// Refuse a request, suggesting the given types.
    pub fn new<E: Into<String>>(
        version: Version, error: E, suggestion: Option<(AssociationKind, SessionKind)>,
    ) -> Self {
        AssociateUnsuccessfulResponse {
            error: Some(error.into()),
            assoc_type: suggestion.map(|(kind, _)| kind),
            session_type: suggestion.map(|(_, session)| session),
            ..AssociateUnsuccessfulResponse::empty(version)
        }
    }

    pub(crate) fn empty(version: Version) -> Self {
        AssociateUnsuccessfulResponse {
            version,
            error: None,
            assoc_type: None,
            session_type: None,
            extra: ExtraData::new(),
        }
    }

    /// The suggested association and session type, if the provider named both.
    pub fn suggestion(&self) -> Option<(AssociationKind, SessionKind)> {
        match (self.assoc_type, self.session_type) {
            (Some(kind), Some(session)) => Some((kind, session)),
            _ => None,
        }
    }
}

impl Message for AssociateUnsuccessfulResponse {
    fn description(&self) -> &'static MessageDescription {
        &ASSOCIATE_UNSUCCESSFUL_RESPONSE
    }

    fn version(&self) -> Version {
        self.version
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

    fn is_error(&self) -> bool {
        true
    }
}

/// Asks a provider to authenticate the user, sent through the user agent.
#[derive(Clone, Debug)]
pub struct CheckIdRequest {
    /// The protocol version.
    pub version: Version,

    /// Whether the provider must answer without interacting with the user.
    pub immediate: bool,

    /// The identifier the user claims to own.
    pub claimed_id: Option<String>,

    /// The local identifier at the provider.
    pub identity: Option<String>,

    /// The association the assertion should be signed with.
    pub assoc_handle: Option<String>,

    /// Where to send the assertion.
    pub return_to: Option<Url>,

    /// The url pattern the user is asked to trust, `trust_root` in OpenID 1.1.
    pub realm: Option<String>,

    extra: ExtraData,
}

static CHECK_ID_REQUEST: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<CheckIdRequest>("CheckIdRequest")
        .computed(
            "openid.ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .computed(
            "openid.mode",
            Field::required(),
            |m| Some(String::from(if m.immediate { "checkid_immediate" } else { "checkid_setup" })),
            |m, value| {
                m.immediate = match value {
                    Some("checkid_immediate") => true,
                    Some("checkid_setup") | None => false,
                    Some(other) => return Err(unexpected("openid.mode", other)),
                };
                Ok(())
            },
        )
        .computed(
            "openid.claimed_id",
            Field::optional(),
            |m| since_v20(m.version, m.claimed_id.clone()),
            |m, value| {
                m.claimed_id = value.map(str::to_string);
                Ok(())
            },
        )
        .field("openid.identity", Field::optional(), |m| &m.identity, |m| &mut m.identity)
        .field(
            "openid.assoc_handle",
            Field::optional(),
            |m| &m.assoc_handle,
            |m| &mut m.assoc_handle,
        )
        .field("openid.return_to", Field::optional(), |m| &m.return_to, |m| &mut m.return_to)
        .computed(
            "openid.realm",
            Field::optional(),
            |m| since_v20(m.version, m.realm.clone()),
            |m, value| {
                if value.is_some() {
                    m.realm = value.map(str::to_string);
                }
                Ok(())
            },
        )
        .computed(
            "openid.trust_root",
            Field::optional(),
            |m| until_v20(m.version, m.realm.clone()),
            |m, value| {
                if value.is_some() {
                    m.realm = value.map(str::to_string);
                }
                Ok(())
            },
        )
        .build()
});

impl CheckIdRequest {
    /// Ask the provider to authenticate the user, returning the assertion to `return_to`.
    pub fn new(version: Version, return_to: Url) -> Self {
        CheckIdRequest {
            return_to: Some(return_to),
            ..CheckIdRequest::empty(version)
        }
    }

    pub(crate) fn empty(version: Version) -> Self {
        CheckIdRequest {
            version,
            immediate: false,
            claimed_id: None,
            identity: None,
            assoc_handle: None,
            return_to: None,
            realm: None,
            extra: ExtraData::new(),
        }
    }
}

impl Message for CheckIdRequest {
    fn description(&self) -> &'static MessageDescription {
        &CHECK_ID_REQUEST
    }

    fn version(&self) -> Version {
        self.version
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

    fn validate(&self) -> Result<(), ProtocolError> {
        let name = "CheckIdRequest";
        match self.version {
            Version::V11 => {
                if self.return_to.is_none() {
                    return Err(missing(name, "openid.return_to"));
                }
                if self.identity.is_none() {
                    return Err(missing(name, "openid.identity"));
                }
            }
            Version::V20 => {
                if self.claimed_id.is_some() != self.identity.is_some() {
                    return Err(ProtocolError::InvalidFieldValue {
                        field: "openid.claimed_id".into(),
                        reason: "claimed_id and identity must be present together".into(),
                    });
                }
                if self.return_to.is_none() && self.realm.is_none() {
                    return Err(missing(name, "openid.realm"));
                }
            }
        }

        Ok(())
    }
}

/// The provider asserts that the user owns an identifier.
///
/// In OpenID 2.0 the assertion is signed, expires and is protected against replay through its
/// `openid.response_nonce`. OpenID 1.1 assertions are only signed.
#[derive(Clone, Debug)]
pub struct PositiveAssertion {
    /// The protocol version.
    pub version: Version,

    /// The provider endpoint that issued the assertion.
    pub op_endpoint: Option<Url>,

    /// The identifier the user owns.
    pub claimed_id: Option<String>,

    /// The local identifier at the provider.
    pub identity: Option<String>,

    /// The url the assertion is sent to.
    pub return_to: Option<Url>,

    /// The association that signed the assertion.
    pub assoc_handle: Option<String>,

    /// An association the relying party must forget.
    pub invalidate_handle: Option<String>,

    /// The signed fields, without prefix.
    pub signed: Option<Vec<String>>,

    /// The signature.
    pub sig: Option<Vec<u8>>,

    created: Option<Time>,
    nonce: Option<String>,
    /// The response nonce as received, signed in this exact form.
    response_nonce: Option<String>,
    extra: ExtraData,
}

static POSITIVE_ASSERTION: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<PositiveAssertion>("PositiveAssertion")
        .computed(
            "openid.ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .constant("openid.mode", Field::required().signed(), "id_res")
        .computed(
            "openid.op_endpoint",
            Field::optional().signed(),
            |m| since_v20(m.version, m.op_endpoint.as_ref().map(Url::to_wire)),
            |m, value| {
                m.op_endpoint = decode("openid.op_endpoint", value)?;
                Ok(())
            },
        )
        .computed(
            "openid.claimed_id",
            Field::optional().signed(),
            |m| since_v20(m.version, m.claimed_id.clone()),
            |m, value| {
                m.claimed_id = value.map(str::to_string);
                Ok(())
            },
        )
        .field("openid.identity", Field::optional().signed(), |m| &m.identity, |m| &mut m.identity)
        .field(
            "openid.return_to",
            Field::required().signed(),
            |m| &m.return_to,
            |m| &mut m.return_to,
        )
        .computed(
            "openid.response_nonce",
            Field::optional().signed(),
            |m| match (m.version, &m.response_nonce, m.created, &m.nonce) {
                (Version::V11, ..) => None,
                (_, Some(received), _, _) => Some(received.clone()),
                (_, None, Some(created), Some(nonce)) => {
                    Some(format_response_nonce(created, nonce))
                }
                _ => None,
            },
            |m, value| {
                let (created, nonce) = match value {
                    Some(value) => {
                        let (created, nonce) = parse_response_nonce(value)?;
                        (Some(created), Some(nonce))
                    }
                    None => (None, None),
                };
                m.created = created;
                m.nonce = nonce;
                m.response_nonce = value.map(str::to_string);
                Ok(())
            },
        )
        .field(
            "openid.invalidate_handle",
            Field::optional(),
            |m| &m.invalidate_handle,
            |m| &mut m.invalidate_handle,
        )
        .field(
            "openid.assoc_handle",
            Field::optional().signed(),
            |m| &m.assoc_handle,
            |m| &mut m.assoc_handle,
        )
        .field("openid.signed", Field::optional(), |m| &m.signed, |m| &mut m.signed)
        .field("openid.sig", Field::optional(), |m| &m.sig, |m| &mut m.sig)
        .build()
});

impl PositiveAssertion {
    /// An unsigned assertion from the provider at `op_endpoint`, to be sent to `return_to`.
    pub fn new(version: Version, op_endpoint: Url, return_to: Url) -> Self {
        PositiveAssertion {
            op_endpoint: Some(op_endpoint),
            return_to: Some(return_to),
            ..PositiveAssertion::empty(version)
        }
    }

    /// Answer an authentication request.
    ///
    /// The assertion is signed with the association the request names, if the provider still
    /// has it.
    pub fn for_request(request: &CheckIdRequest, op_endpoint: Url) -> Result<Self, ProtocolError> {
        let return_to = request
            .return_to
            .clone()
            .ok_or_else(|| missing("CheckIdRequest", "openid.return_to"))?;

        Ok(PositiveAssertion {
            claimed_id: request.claimed_id.clone(),
            identity: request.identity.clone(),
            assoc_handle: request.assoc_handle.clone(),
            ..PositiveAssertion::new(request.version, op_endpoint, return_to)
        })
    }

    pub(crate) fn empty(version: Version) -> Self {
        PositiveAssertion {
            version,
            op_endpoint: None,
            claimed_id: None,
            identity: None,
            return_to: None,
            assoc_handle: None,
            invalidate_handle: None,
            signed: None,
            sig: None,
            created: None,
            nonce: None,
            response_nonce: None,
            extra: ExtraData::new(),
        }
    }
}

impl Message for PositiveAssertion {
    fn description(&self) -> &'static MessageDescription {
        &POSITIVE_ASSERTION
    }

    fn version(&self) -> Version {
        self.version
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

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.version == Version::V11 {
            return Ok(());
        }

        let name = "PositiveAssertion";
        if self.op_endpoint.is_none() {
            return Err(missing(name, "openid.op_endpoint"));
        }

        if self.created.is_none() || self.nonce.is_none() {
            return Err(missing(name, "openid.response_nonce"));
        }

        if self.claimed_id.is_some() != self.identity.is_some() {
            return Err(ProtocolError::InvalidFieldValue {
                field: "openid.claimed_id".into(),
                reason: "claimed_id and identity must be present together".into(),
            });
        }

        Ok(())
    }

    fn required_protections(&self) -> Protections {
        match self.version {
            Version::V11 => ProtectionKind::TamperProtection.into(),
            Version::V20 => Protections::all(),
        }
    }

    fn expiring(&mut self) -> Option<&mut dyn Expiring> {
        match self.version {
            Version::V11 => None,
            Version::V20 => Some(self),
        }
    }

    fn replay_protected(&mut self) -> Option<&mut dyn ReplayProtected> {
        match self.version {
            Version::V11 => None,
            Version::V20 => Some(self),
        }
    }

    fn signed(&mut self) -> Option<&mut dyn Signed> {
        Some(self)
    }
}

impl Expiring for PositiveAssertion {
    fn created(&self) -> Option<Time> {
        self.created
    }

    fn set_created(&mut self, created: Time) {
        self.created = Some(created);
        self.response_nonce = None;
    }
}

impl ReplayProtected for PositiveAssertion {
    fn nonce_context(&self) -> Option<String> {
        self.op_endpoint.as_ref().map(Url::to_wire)
    }

    fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    fn set_nonce(&mut self, nonce: String) {
        self.nonce = Some(nonce);
        self.response_nonce = None;
    }

    fn nonce_timestamp(&self) -> Option<Time> {
        self.created
    }
}

impl Signed for PositiveAssertion {
    fn association_handle(&self) -> Option<&str> {
        self.assoc_handle.as_deref()
    }

    fn set_association_handle(&mut self, handle: String) {
        self.assoc_handle = Some(handle);
    }

    fn invalidate_handle(&self) -> Option<&str> {
        self.invalidate_handle.as_deref()
    }

    fn set_invalidate_handle(&mut self, handle: Option<String>) {
        self.invalidate_handle = handle;
    }

    fn signed_fields(&self) -> Option<&[String]> {
        self.signed.as_deref()
    }

    fn set_signed_fields(&mut self, fields: Vec<String>) {
        self.signed = Some(fields);
    }

    fn signature(&self) -> Option<&[u8]> {
        self.sig.as_deref()
    }

    fn set_signature(&mut self, signature: Vec<u8>) {
        self.sig = Some(signature);
    }

    fn signer_endpoint(&self) -> Option<&Url> {
        self.op_endpoint.as_ref()
    }
}

/// The provider could not or would not authenticate the user.
#[derive(Clone, Debug)]
pub struct NegativeAssertion {
    /// The protocol version.
    pub version: Version,

    /// Answers an immediate request that needs user interaction.
    pub immediate: bool,

    /// Where the user can complete the authentication, OpenID 1.1 only.
    pub user_setup_url: Option<Url>,

    extra: ExtraData,
}

static NEGATIVE_ASSERTION: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<NegativeAssertion>("NegativeAssertion")
        .computed(
            "openid.ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .computed(
            "openid.mode",
            Field::required(),
            |m| Some(String::from(negative_mode(m.version, m.immediate))),
            |m, value| {
                m.immediate = match value {
                    Some("cancel") | None => false,
                    Some("setup_needed") | Some("id_res") => true,
                    Some(other) => return Err(unexpected("openid.mode", other)),
                };
                Ok(())
            },
        )
        .field(
            "openid.user_setup_url",
            Field::optional(),
            |m| &m.user_setup_url,
            |m| &mut m.user_setup_url,
        )
        .build()
});

impl NegativeAssertion {
    /// The user cancelled the authentication.
    pub fn cancel(version: Version) -> Self {
        NegativeAssertion::empty(version)
    }

    /// An immediate request needs user interaction.
    pub fn setup_needed(version: Version, user_setup_url: Option<Url>) -> Self {
        NegativeAssertion {
            immediate: true,
            user_setup_url,
            ..NegativeAssertion::empty(version)
        }
    }

    pub(crate) fn empty(version: Version) -> Self {
        NegativeAssertion {
            version,
            immediate: false,
            user_setup_url: None,
            extra: ExtraData::new(),
        }
    }
}

impl Message for NegativeAssertion {
    fn description(&self) -> &'static MessageDescription {
        &NEGATIVE_ASSERTION
    }

    fn version(&self) -> Version {
        self.version
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

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.version == Version::V11 && self.immediate && self.user_setup_url.is_none() {
            return Err(missing("NegativeAssertion", "openid.user_setup_url"));
        }

        Ok(())
    }
}

/// Asks the provider whether an assertion is authentic.
///
/// Carries every parameter of the assertion except its mode. Used by relying parties which
/// share no association with the provider.
#[derive(Clone, Debug)]
pub struct CheckAuthenticationRequest {
    /// The protocol version.
    pub version: Version,

    extra: ExtraData,
}

static CHECK_AUTHENTICATION_REQUEST: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<CheckAuthenticationRequest>("CheckAuthenticationRequest")
        .computed(
            "openid.ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .constant("openid.mode", Field::required(), "check_authentication")
        .build()
});

impl CheckAuthenticationRequest {
    /// Ask about the given assertion parameters.
    pub fn new<I, K, V>(version: Version, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut request = CheckAuthenticationRequest::empty(version);
        for (key, value) in fields {
            let key = key.as_ref();
            if key != "openid.mode" && key != "openid.ns" {
                request.extra.insert(key, value.as_ref());
            }
        }
        request
    }

    /// Ask about an assertion.
    pub fn from_assertion(assertion: &PositiveAssertion) -> Self {
        CheckAuthenticationRequest::new(assertion.version, pairs(assertion))
    }

    pub(crate) fn empty(version: Version) -> Self {
        CheckAuthenticationRequest {
            version,
            extra: ExtraData::new(),
        }
    }

    /// Reconstruct the assertion the relying party received.
    pub fn assertion(&self) -> Result<PositiveAssertion, ProtocolError> {
        let mut assertion = PositiveAssertion::empty(self.version);
        MessageDictionary::new(&mut assertion).extend(self.extra.iter())?;
        Ok(assertion)
    }
}

impl Message for CheckAuthenticationRequest {
    fn description(&self) -> &'static MessageDescription {
        &CHECK_AUTHENTICATION_REQUEST
    }

    fn version(&self) -> Version {
        self.version
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
}

/// The verdict of the provider on a check authentication request.
#[derive(Clone, Debug)]
pub struct CheckAuthenticationResponse {
    /// The protocol version.
    pub version: Version,

    /// Whether the signature is valid.
    pub is_valid: Option<bool>,

    /// An association the relying party must forget.
    pub invalidate_handle: Option<String>,

    extra: ExtraData,
}

static CHECK_AUTHENTICATION_RESPONSE: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<CheckAuthenticationResponse>("CheckAuthenticationResponse")
        .computed(
            "ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .field("is_valid", Field::required(), |m| &m.is_valid, |m| &mut m.is_valid)
        .field(
            "invalidate_handle",
            Field::optional(),
            |m| &m.invalidate_handle,
            |m| &mut m.invalidate_handle,
        )
        .build()
});

impl CheckAuthenticationResponse {
    /// Answer a check authentication request.
    pub fn new(version: Version, is_valid: bool, invalidate_handle: Option<String>) -> Self {
        CheckAuthenticationResponse {
            is_valid: Some(is_valid),
            invalidate_handle,
            ..CheckAuthenticationResponse::empty(version)
        }
    }

    pub(crate) fn empty(version: Version) -> Self {
        CheckAuthenticationResponse {
            version,
            is_valid: None,
            invalidate_handle: None,
            extra: ExtraData::new(),
        }
    }
}

impl Message for CheckAuthenticationResponse {
    fn description(&self) -> &'static MessageDescription {
        &CHECK_AUTHENTICATION_RESPONSE
    }

    fn version(&self) -> Version {
        self.version
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
}

/// An error reported to the relying party through the user agent.
#[derive(Clone, Debug)]
pub struct IndirectErrorResponse {
    /// The protocol version.
    pub version: Version,

    /// A human readable description.
    pub error: Option<String>,

    /// Contact address of the provider administrator.
    pub contact: Option<String>,

    /// A reference token, such as a support ticket number.
    pub reference: Option<String>,

    extra: ExtraData,
}

static INDIRECT_ERROR_RESPONSE: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<IndirectErrorResponse>("IndirectErrorResponse")
        .computed(
            "openid.ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .constant("openid.mode", Field::required(), "error")
        .field("openid.error", Field::required(), |m| &m.error, |m| &mut m.error)
        .field("openid.contact", Field::optional(), |m| &m.contact, |m| &mut m.contact)
        .field("openid.reference", Field::optional(), |m| &m.reference, |m| &mut m.reference)
        .build()
});

impl IndirectErrorResponse {
    /// Report an error.
    pub fn new<E: Into<String>>(version: Version, error: E) -> Self {
        IndirectErrorResponse {
            error: Some(error.into()),
            ..IndirectErrorResponse::empty(version)
        }
    }

    pub(crate) fn empty(version: Version) -> Self {
        IndirectErrorResponse {
            version,
            error: None,
            contact: None,
            reference: None,
            extra: ExtraData::new(),
        }
    }
}

impl Message for IndirectErrorResponse {
    fn description(&self) -> &'static MessageDescription {
        &INDIRECT_ERROR_RESPONSE
    }

    fn version(&self) -> Version {
        self.version
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

    fn is_error(&self) -> bool {
        true
    }
}

/// An error answering a direct request.
#[derive(Clone, Debug)]
pub struct DirectErrorResponse {
    /// The protocol version.
    pub version: Version,

    /// A human readable description.
    pub error: Option<String>,

    /// Contact address of the provider administrator.
    pub contact: Option<String>,

    /// A reference token, such as a support ticket number.
    pub reference: Option<String>,

    extra: ExtraData,
}

static DIRECT_ERROR_RESPONSE: Lazy<MessageDescription> = Lazy::new(|| {
    MessageDescription::builder::<DirectErrorResponse>("DirectErrorResponse")
        .computed(
            "ns",
            Field::optional(),
            |m| namespace(m.version),
            |m, value| read_namespace(&mut m.version, value),
        )
        .field("error", Field::required(), |m| &m.error, |m| &mut m.error)
        .field("contact", Field::optional(), |m| &m.contact, |m| &mut m.contact)
        .field("reference", Field::optional(), |m| &m.reference, |m| &mut m.reference)
        .build()
});

impl DirectErrorResponse {
    /// Report an error.
    pub fn new<E: Into<String>>(version: Version, error: E) -> Self {
        DirectErrorResponse {
            error: Some(error.into()),
            ..DirectErrorResponse::empty(version)
        }
    }

    pub(crate) fn empty(version: Version) -> Self {
        DirectErrorResponse {
            version,
            error: None,
            contact: None,
            reference: None,
            extra: ExtraData::new(),
        }
    }
}

impl Message for DirectErrorResponse {
    fn description(&self) -> &'static MessageDescription {
        &DIRECT_ERROR_RESPONSE
    }

    fn version(&self) -> Version {
        self.version
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

    fn is_error(&self) -> bool {
        true
    }
}

/// Format the creation time and unique part of a response nonce.
pub fn format_response_nonce(created: Time, unique: &str) -> String {
    format!("{}{}", created.to_rfc3339_opts(SecondsFormat::Secs, true), unique)
}

/// Split a response nonce into its creation time and unique part.
pub fn parse_response_nonce(value: &str) -> Result<(Time, String), ProtocolError> {
    let malformed = || ProtocolError::InvalidFieldValue {
        field: "openid.response_nonce".into(),
        reason: "expected a UTC timestamp followed by a unique string".into(),
    };

    let end = value.find('Z').ok_or_else(malformed)? + 1;
    let created = DateTime::parse_from_rfc3339(&value[..end]).map_err(|_| malformed())?;
    Ok((created.with_timezone(&Utc), value[end..].to_string()))
}

fn negative_mode(version: Version, immediate: bool) -> &'static str {
    match (version, immediate) {
        (_, false) => "cancel",
        (Version::V11, true) => "id_res",
        (Version::V20, true) => "setup_needed",
    }
}

fn namespace(version: Version) -> Option<String> {
    version.namespace().map(str::to_string)
}

fn read_namespace(version: &mut Version, value: Option<&str>) -> Result<(), ProtocolError> {
    if let Some(value) = value {
        *version = Version::from_namespace(Some(value))?;
    }
    Ok(())
}

fn since_v20(version: Version, value: Option<String>) -> Option<String> {
    value.filter(|_| version == Version::V20)
}

fn until_v20(version: Version, value: Option<String>) -> Option<String> {
    value.filter(|_| version == Version::V11)
}

fn decode<T: WireValue>(field: &str, value: Option<&str>) -> Result<Option<T>, ProtocolError> {
    value
        .map(|value| {
            T::from_wire(value).map_err(|err| match err {
                ProtocolError::InvalidFieldValue { reason, .. } => {
                    ProtocolError::InvalidFieldValue {
                        field: field.to_string(),
                        reason,
                    }
                }
                other => other,
            })
        })
        .transpose()
}

fn missing(message: &'static str, field: &str) -> ProtocolError {
    ProtocolError::MissingRequiredField {
        message,
        field: field.to_string(),
    }
}

fn unexpected(field: &str, value: &str) -> ProtocolError {
    ProtocolError::InvalidFieldValue {
        field: field.to_string(),
        reason: format!("unexpected value {:?}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::message::dictionary::read;
    use crate::message::OPENID2_NAMESPACE;
    use crate::primitives::generator::RandomGenerator;

    fn url(text: &str) -> Url {
        Url::parse(text).unwrap()
    }

    #[test]
    fn response_nonce_format() {
        let created = Utc.ymd(2005, 5, 15).and_hms(17, 11, 51);
        assert_eq!(format_response_nonce(created, "UNIQUE"), "2005-05-15T17:11:51ZUNIQUE");

        let (parsed, unique) = parse_response_nonce("2005-05-15T17:11:51ZUNIQUE").unwrap();
        assert_eq!(parsed, created);
        assert_eq!(unique, "UNIQUE");

        assert!(parse_response_nonce("UNIQUE").is_err());
        assert!(parse_response_nonce("yesterdayZUNIQUE").is_err());
    }

    #[test]
    fn response_nonce_kept_as_received() {
        let received = "2005-05-15T17:11:51.250ZUNIQUE";
        let mut assertion = PositiveAssertion::empty(Version::V20);
        MessageDictionary::new(&mut assertion)
            .set("openid.response_nonce", Some(received))
            .unwrap();
        assert_eq!(assertion.nonce(), Some("UNIQUE"));
        assert_eq!(read(&assertion, "openid.response_nonce").as_deref(), Some(received));

        assertion.set_nonce("OTHER".into());
        assert_eq!(
            read(&assertion, "openid.response_nonce").as_deref(),
            Some("2005-05-15T17:11:51ZOTHER")
        );
    }

    #[test]
    fn assertion_wire_form() {
        let mut assertion = PositiveAssertion::new(
            Version::V20,
            url("https://op.example/server"),
            url("https://rp.example/cb?session=1"),
        );
        assertion.set_created(Utc.ymd(2024, 1, 1).and_hms(0, 0, 0));
        assertion.set_nonce("abc".into());

        assert_eq!(read(&assertion, "openid.ns").as_deref(), Some(OPENID2_NAMESPACE));
        assert_eq!(read(&assertion, "openid.mode").as_deref(), Some("id_res"));
        assert_eq!(
            read(&assertion, "openid.response_nonce").as_deref(),
            Some("2024-01-01T00:00:00Zabc")
        );
        assert!(assertion.validate().is_ok());

        let mut copy = PositiveAssertion::empty(Version::V20);
        MessageDictionary::new(&mut copy).extend(pairs(&assertion)).unwrap();
        assert_eq!(copy.created(), assertion.created());
        assert_eq!(copy.nonce(), Some("abc"));
        assert_eq!(copy.return_to, assertion.return_to);
    }

    #[test]
    fn openid1_assertions() {
        let mut assertion = PositiveAssertion::new(
            Version::V11,
            url("https://op.example/server"),
            url("https://rp.example/cb"),
        );
        assertion.claimed_id = Some("https://alice.example/".into());

        // Neither namespace nor the 2.0 only fields are sent.
        assert_eq!(read(&assertion, "openid.ns"), None);
        assert_eq!(read(&assertion, "openid.op_endpoint"), None);
        assert_eq!(read(&assertion, "openid.claimed_id"), None);
        assert!(assertion.expiring().is_none());
        assert_eq!(
            assertion.required_protections(),
            Protections::from(ProtectionKind::TamperProtection)
        );
    }

    #[test]
    fn assertion_requires_nonce_and_endpoint() {
        let mut assertion = PositiveAssertion::empty(Version::V20);
        assertion.return_to = Some(url("https://rp.example/cb"));
        assert!(matches!(
            assertion.validate(),
            Err(ProtocolError::MissingRequiredField { .. })
        ));

        assertion.op_endpoint = Some(url("https://op.example/server"));
        assert!(assertion.validate().is_err());

        assertion.set_created(Utc::now());
        assertion.set_nonce("n".into());
        assertion.claimed_id = Some("https://alice.example/".into());
        assert!(matches!(
            assertion.validate(),
            Err(ProtocolError::InvalidFieldValue { .. })
        ));
    }

    #[test]
    fn check_id_realm_by_version() {
        let mut request = CheckIdRequest::new(Version::V20, url("https://rp.example/cb"));
        request.realm = Some("https://rp.example/".into());
        assert_eq!(read(&request, "openid.realm").as_deref(), Some("https://rp.example/"));
        assert_eq!(read(&request, "openid.trust_root"), None);
        assert_eq!(read(&request, "openid.mode").as_deref(), Some("checkid_setup"));

        request.version = Version::V11;
        request.immediate = true;
        assert_eq!(read(&request, "openid.realm"), None);
        assert_eq!(read(&request, "openid.trust_root").as_deref(), Some("https://rp.example/"));
        assert_eq!(read(&request, "openid.mode").as_deref(), Some("checkid_immediate"));
        assert!(request.validate().is_err());
    }

    #[test]
    fn negative_modes() {
        let cancel = NegativeAssertion::cancel(Version::V20);
        assert_eq!(read(&cancel, "openid.mode").as_deref(), Some("cancel"));
        assert_eq!(
            read(&NegativeAssertion::setup_needed(Version::V20, None), "openid.mode").as_deref(),
            Some("setup_needed")
        );

        let openid1 = NegativeAssertion::setup_needed(Version::V11, None);
        assert_eq!(read(&openid1, "openid.mode").as_deref(), Some("id_res"));
        assert!(openid1.validate().is_err());
    }

    #[test]
    fn unencrypted_association_response() {
        let random = RandomGenerator::new();
        let association =
            Association::generate(AssociationKind::HmacSha1, Duration::hours(1), &random);
        let request = AssociateRequest::unencrypted(Version::V20, AssociationKind::HmacSha1);
        let response = AssociateSuccessfulResponse::new(&request, &association, None).unwrap();

        assert_eq!(response.mac_key.as_deref(), Some(association.secret()));
        assert!(response.enc_mac_key.is_none());
        let recovered = response.association(None).unwrap();
        assert_eq!(recovered.handle(), association.handle());
        assert_eq!(recovered.secret(), association.secret());
        assert_eq!(recovered.lifetime(), Duration::hours(1));
    }

    #[test]
    fn diffie_hellman_association_response() {
        let random = RandomGenerator::new();
        let association =
            Association::generate(AssociationKind::HmacSha256, Duration::hours(1), &random);
        let consumer = DiffieHellman::new(&random);
        let request = AssociateRequest::diffie_hellman(
            Version::V20,
            AssociationKind::HmacSha256,
            SessionKind::DhSha256,
            &consumer,
        );
        assert!(request.dh_modulus.is_none());
        assert!(request.validate().is_ok());

        let server = DiffieHellman::new(&random);
        let response =
            AssociateSuccessfulResponse::new(&request, &association, Some(&server)).unwrap();
        assert!(response.mac_key.is_none());
        assert_ne!(response.enc_mac_key.as_deref(), Some(association.secret()));

        let recovered = response.association(Some(&consumer)).unwrap();
        assert_eq!(recovered.secret(), association.secret());
        assert!(response.association(None).is_err());
    }

    #[test]
    fn check_authentication_carries_assertion() {
        let mut assertion = PositiveAssertion::new(
            Version::V20,
            url("https://op.example/server"),
            url("https://rp.example/cb"),
        );
        assertion.assoc_handle = Some("handle".into());
        assertion.sig = Some(vec![1, 2, 3]);
        assertion.signed = Some(vec!["mode".into(), "return_to".into()]);

        let request = CheckAuthenticationRequest::from_assertion(&assertion);
        assert_eq!(read(&request, "openid.mode").as_deref(), Some("check_authentication"));
        assert_eq!(read(&request, "openid.assoc_handle").as_deref(), Some("handle"));

        let rebuilt = request.assertion().unwrap();
        assert_eq!(rebuilt.assoc_handle, assertion.assoc_handle);
        assert_eq!(rebuilt.sig, assertion.sig);
        assert_eq!(rebuilt.signed, assertion.signed);
        assert_eq!(rebuilt.op_endpoint, assertion.op_endpoint);
    }
}
