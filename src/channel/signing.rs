//! Signs outgoing messages and verifies the signature of incoming ones.
//!
//! The signature covers an ordered list of fields, named without their `openid.` prefix in the
//! `openid.signed` field of the message itself. The base string is the key-value form of those
//! names with their values, and the signature is the HMAC of the base string under the secret of
//! the association named in `openid.assoc_handle`.
//!
//! A provider signs with a shared association when the relying party asked for one that is still
//! valid. Otherwise it signs with a private association and asks the relying party to forget the
//! stale handle through `openid.invalidate_handle`. A relying party without the association a
//! message was signed with can only ask the provider whether the signature is valid, which a
//! `DirectVerifier` does for it.
use std::sync::Arc;

use chrono::{Duration, Utc};
use url::Url;

use super::binding::{BindingElement, ProtectionKind};
use super::error::ProtocolError;
use crate::config::SecuritySettings;
use crate::message::dictionary::{pairs as wire_pairs, read};
use crate::message::{Message, Signed};
use crate::primitives::association::{Association, AssociationKind, AssociationStore};
use crate::primitives::generator::RandomGenerator;

/// Prefix of signed field names on the wire, omitted in the list of signed fields.
pub const SIGNED_PREFIX: &str = "openid.";

/// Store key of the associations a provider shares with relying parties.
pub const SHARED_ASSOCIATIONS: &str = "shared";

/// Store key of the associations a provider keeps to itself.
pub const PRIVATE_ASSOCIATIONS: &str = "private";

/// The party a signing element works for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Signs assertions and verifies signatures for relying parties in dumb mode.
    Provider,

    /// Verifies assertions.
    RelyingParty,
}

/// The answer of a provider asked to verify a signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verification {
    /// Whether the signature is valid.
    pub is_valid: bool,

    /// A handle the relying party must no longer use.
    pub invalidate_handle: Option<String>,
}

/// Verifies a signature by asking the signing party.
pub trait DirectVerifier: Send + Sync {
    /// Ask the provider at `endpoint` whether the message with the given fields is authentic.
    fn verify(
        &self,
        endpoint: &Url,
        fields: &[(String, String)],
    ) -> Result<Verification, ProtocolError>;
}

/// Applies tamper protection to signed messages.
pub struct SigningElement {
    associations: Arc<dyn AssociationStore>,
    role: Role,
    private_kind: AssociationKind,
    private_lifetime: Duration,
    verifier: Option<Box<dyn DirectVerifier>>,
    random: RandomGenerator,
}

impl SigningElement {
    /// The signing element of a provider.
    pub fn provider(associations: Arc<dyn AssociationStore>, settings: &SecuritySettings) -> Self {
        let private_kind =
            AssociationKind::best(settings.minimum_hash_bits, settings.maximum_hash_bits)
                .unwrap_or(AssociationKind::HmacSha256);

        SigningElement {
            associations,
            role: Role::Provider,
            private_kind,
            private_lifetime: settings.private_secret_lifetime,
            verifier: None,
            random: RandomGenerator::new(),
        }
    }

    /// The signing element of a relying party.
    ///
    /// Without a verifier, messages signed with an unknown association are rejected.
    pub fn relying_party(
        associations: Arc<dyn AssociationStore>, verifier: Option<Box<dyn DirectVerifier>>,
    ) -> Self {
        SigningElement {
            associations,
            role: Role::RelyingParty,
            private_kind: AssociationKind::HmacSha256,
            private_lifetime: Duration::zero(),
            verifier,
            random: RandomGenerator::new(),
        }
    }

    /// The role this element signs or verifies for.
    pub fn role(&self) -> Role {
        self.role
    }

    fn private_association(&self) -> Result<Association, ProtocolError> {
        let now = Utc::now();
        if let Some(existing) = self.associations.get(PRIVATE_ASSOCIATIONS, None)? {
            if existing.has_useful_life_remaining(self.private_lifetime / 2, now) {
                return Ok(existing);
            }
        }

        let association =
            Association::generate(self.private_kind, self.private_lifetime, &self.random);
        debug!("Created private association {}", association.handle());
        self.associations.store(PRIVATE_ASSOCIATIONS, association.clone())?;
        Ok(association)
    }

    fn find_association(
        &self,
        handle: &str,
        endpoint: Option<&Url>,
    ) -> Result<Option<Association>, ProtocolError> {
        let key = match (self.role, endpoint) {
            (Role::Provider, _) => SHARED_ASSOCIATIONS,
            (Role::RelyingParty, Some(endpoint)) => endpoint.as_str(),
            (Role::RelyingParty, None) => return Ok(None),
        };

        Ok(self.associations.get(key, Some(handle))?)
    }
}

impl BindingElement for SigningElement {
    fn protection(&self) -> Option<ProtectionKind> {
        Some(ProtectionKind::TamperProtection)
    }

    fn prepare_for_sending(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError> {
        let requested = match message.signed() {
            Some(signed) => signed.association_handle().map(str::to_string),
            None => return Ok(None),
        };

        if self.role == Role::RelyingParty {
            return Err(ProtocolError::Configuration(
                "a relying party does not sign messages".into(),
            ));
        }

        let mut invalidate = None;
        let association = match requested {
            Some(handle) => match self.associations.get(SHARED_ASSOCIATIONS, Some(&handle))? {
                Some(association) => association,
                None => {
                    debug!("Association {} unknown or expired, signing privately", handle);
                    invalidate = Some(handle);
                    self.private_association()?
                }
            },
            None => self.private_association()?,
        };

        {
            let signed = signable(message)?;
            signed.set_association_handle(association.handle().to_string());
            signed.set_invalidate_handle(invalidate);
        }

        let names = names_to_sign(&*message);
        let base = base_pairs(&*message, &names)?;
        let signature = association.sign(base)?;

        let signed = signable(message)?;
        signed.set_signed_fields(names);
        signed.set_signature(signature);
        Ok(Some(ProtectionKind::TamperProtection))
    }

    fn prepare_for_receiving(
        &self,
        message: &mut dyn Message,
    ) -> Result<Option<ProtectionKind>, ProtocolError> {
        let (handle, endpoint) = match message.signed() {
            Some(signed) => (
                signed.association_handle().map(str::to_string),
                signed.signer_endpoint().cloned(),
            ),
            None => return Ok(None),
        };

        let handle = handle.ok_or_else(|| ProtocolError::MissingRequiredField {
            message: message.description().name(),
            field: "openid.assoc_handle".into(),
        })?;

        match self.find_association(&handle, endpoint.as_ref())? {
            Some(association) => {
                if verify_signature(&association, message)? {
                    Ok(Some(ProtectionKind::TamperProtection))
                } else {
                    error!(
                        "Invalid signature on {} with association {}",
                        message.description().name(),
                        handle
                    );
                    Err(ProtocolError::InvalidSignature)
                }
            }
            None => {
                let (verifier, endpoint) = match (&self.verifier, endpoint) {
                    (Some(verifier), Some(endpoint)) => (verifier, endpoint),
                    _ => {
                        error!(
                            "No association {} to verify {}",
                            handle,
                            message.description().name()
                        );
                        return Err(ProtocolError::InvalidSignature);
                    }
                };

                // The provider checks the signed list as well, but only we know the schema.
                let names = signed_list(message)?;
                ensure_mandatory_signed(&*message, &names)?;

                info!("Verifying {} directly with {}", message.description().name(), endpoint);
                let verification = verifier.verify(&endpoint, &wire_pairs(&*message))?;
                if let Some(invalid) = verification.invalidate_handle {
                    self.associations.remove(endpoint.as_str(), &invalid)?;
                }

                if verification.is_valid {
                    Ok(Some(ProtectionKind::TamperProtection))
                } else {
                    error!(
                        "Provider {} rejected the signature of {}",
                        endpoint,
                        message.description().name()
                    );
                    Err(ProtocolError::InvalidSignature)
                }
            }
        }
    }
}

/// Check the signature of a message against an association.
///
/// Fails if a field that must be signed is not part of the signature. Returns whether the
/// signature matches.
pub fn verify_signature(
    association: &Association,
    message: &mut dyn Message,
) -> Result<bool, ProtocolError> {
    let names = signed_list(message)?;
    ensure_mandatory_signed(&*message, &names)?;

    let signature = message
        .signed()
        .and_then(|signed| signed.signature().map(<[u8]>::to_vec));
    let signature = match signature {
        Some(signature) => signature,
        None => {
            return Err(ProtocolError::MissingRequiredField {
                message: message.description().name(),
                field: "openid.sig".into(),
            })
        }
    };

    let base = base_pairs(&*message, &names)?;
    Ok(association.verify(base, &signature))
}

fn signable(message: &mut dyn Message) -> Result<&mut dyn Signed, ProtocolError> {
    message
        .signed()
        .ok_or_else(|| ProtocolError::Configuration("message is not signable".into()))
}

fn signed_list(message: &mut dyn Message) -> Result<Vec<String>, ProtocolError> {
    let name = message.description().name();
    match message.signed().and_then(|signed| signed.signed_fields().map(<[String]>::to_vec)) {
        Some(names) if !names.is_empty() => Ok(names),
        _ => Err(ProtocolError::MissingRequiredField {
            message: name,
            field: "openid.signed".into(),
        }),
    }
}

/// Described fields that must be signed and have a value, then any extension parameters.
fn names_to_sign(message: &dyn Message) -> Vec<String> {
    let description = message.description();
    let described = description
        .signed_fields()
        .filter(|field| field.get_value(message).is_some())
        .filter_map(|field| field.name().strip_prefix(SIGNED_PREFIX))
        .map(str::to_string);

    let extensions = message
        .extra()
        .iter()
        .filter(|(key, _)| description.field(key).is_none())
        .filter_map(|(key, _)| key.strip_prefix(SIGNED_PREFIX))
        .map(str::to_string);

    described.chain(extensions).collect()
}

/// Described fields that must be signed and every extension parameter have to be in `names`.
fn ensure_mandatory_signed(message: &dyn Message, names: &[String]) -> Result<(), ProtocolError> {
    let description = message.description();
    let is_signed = |key: &str| {
        let short = key.strip_prefix(SIGNED_PREFIX).unwrap_or(key);
        names.iter().any(|name| name == short)
    };

    let described = description
        .signed_fields()
        .filter(|field| field.get_value(message).is_some())
        .map(|field| field.name().to_string());

    let extensions = message
        .extra()
        .iter()
        .filter(|(key, _)| description.field(key).is_none())
        .filter(|(key, _)| key.starts_with(SIGNED_PREFIX))
        .map(|(key, _)| key.to_string());

    let unsigned: Vec<String> = described
        .chain(extensions)
        .filter(|key| !is_signed(key.as_str()))
        .collect();

    if unsigned.is_empty() {
        Ok(())
    } else {
        error!("Fields {:?} of {} are not signed", unsigned, message.description().name());
        Err(ProtocolError::UnsignedMandatoryParts(unsigned))
    }
}

fn base_pairs(
    message: &dyn Message,
    names: &[String],
) -> Result<Vec<(String, String)>, ProtocolError> {
    names
        .iter()
        .map(|name| {
            let key = format!("{}{}", SIGNED_PREFIX, name);
            match read(message, &key) {
                Some(value) => Ok((name.clone(), value)),
                None => Err(ProtocolError::MissingRequiredField {
                    message: message.description().name(),
                    field: key,
                }),
            }
        })
        .collect()
}
