//! # oxide-openid
//!
//! The message engine of an OpenID 2.0 relying party or provider: associations and their HMAC
//! signatures, Diffie-Hellman association establishment, a declarative message schema, and a
//! channel that applies expiration, replay and tamper protection to every message passing
//! through it.
//!
//! ## About
//!
//! Like `oxide-auth`, this library does not speak HTTP itself. It turns typed messages into
//! redirect urls, form posts and key-value bodies, and it turns the parameters of incoming
//! requests back into typed, validated messages. Hosting, sessions and discovery are left to the
//! front-end, while storage of associations and nonces is pluggable through traits with simple
//! in-memory implementations provided.
//!
//! ## Sending and receiving
//!
//! Every message is described by a static [`MessageDescription`] listing its fields, which fields
//! are required, and which are covered by the signature. A [`Channel`] owns an ordered list of
//! [`BindingElement`]s. Before a message leaves, each element stamps what it protects: the
//! creation time, a fresh nonce, a signature. When a message arrives the channel recognizes its
//! concrete type from the parameters and runs the same elements in reverse, so that no message
//! reaches application code unless its signature, nonce and age have all been verified.
//!
//! ```ignore
//! # extern crate oxide_openid;
//! use std::sync::Arc;
//! use oxide_openid::channel::Channel;
//! use oxide_openid::config::SecuritySettings;
//! use oxide_openid::channel::signing::Role;
//! use oxide_openid::openid;
//! use oxide_openid::primitives::prelude::*;
//!
//! let settings = SecuritySettings::default();
//! let associations = Arc::new(AssociationMap::new());
//! let channel = openid::channel(
//!     Role::RelyingParty,
//!     &settings,
//!     associations,
//!     Box::new(NonceMap::new(settings.maximum_message_age())),
//!     None,
//! )?;
//! let message = channel.read_from_request(&request_parameters)?;
//! ```
//!
//! [`MessageDescription`]: message/description/struct.MessageDescription.html
//! [`Channel`]: channel/struct.Channel.html
//! [`BindingElement`]: channel/binding/trait.BindingElement.html
#![warn(missing_docs)]

extern crate base64;
extern crate chrono;
extern crate hmac;
#[macro_use]
extern crate log;
extern crate num_bigint;
extern crate once_cell;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate serde_urlencoded;
extern crate sha1;
extern crate sha2;
extern crate thiserror;
extern crate url;

pub mod channel;
pub mod config;
pub mod message;
pub mod openid;
pub mod primitives;
