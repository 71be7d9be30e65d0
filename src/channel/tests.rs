use std::sync::Arc;

use chrono::{Duration, Utc};
use url::Url;

use super::*;
use crate::channel::error::ErrorKind;
use crate::channel::expiration::ExpirationElement;
use crate::channel::signing::{SigningElement, SHARED_ASSOCIATIONS};
use crate::config::SecuritySettings;
use crate::message::dictionary::pairs;
use crate::message::{Expiring, ReplayProtected, Version};
use crate::openid::factory::{IncomingMessage, OpenIdFactory};
use crate::openid::messages::*;
use crate::primitives::association::{
    Association, AssociationKind, AssociationMap, AssociationStore,
};
use crate::primitives::generator::RandomGenerator;
use crate::primitives::nonce::NonceMap;
use crate::primitives::Time;

const OP: &str = "https://op.example/server";
const RP: &str = "https://rp.example/return";

/// A provider and a relying party channel sharing one association.
struct Pair {
    provider: Channel<OpenIdFactory>,
    relying_party: Channel<OpenIdFactory>,
    association: Association,
    handle: String,
}

fn pair() -> Pair {
    let settings = SecuritySettings::default();
    let association = Association::generate(
        AssociationKind::HmacSha256,
        Duration::days(1),
        &RandomGenerator::new(),
    );

    let op_store = Arc::new(AssociationMap::new());
    op_store.store(SHARED_ASSOCIATIONS, association.clone()).unwrap();
    let rp_store = Arc::new(AssociationMap::new());
    rp_store.store(OP, association.clone()).unwrap();

    let provider = crate::openid::channel(
        signing::Role::Provider,
        &settings,
        op_store,
        Box::new(NonceMap::new(settings.maximum_message_age())),
        None,
    )
    .unwrap();
    let relying_party = crate::openid::channel(
        signing::Role::RelyingParty,
        &settings,
        rp_store,
        Box::new(NonceMap::new(settings.maximum_message_age())),
        None,
    )
    .unwrap();

    Pair {
        provider,
        relying_party,
        handle: association.handle().to_string(),
        association,
    }
}

fn assertion(handle: &str) -> PositiveAssertion {
    let mut assertion = PositiveAssertion::new(
        Version::V20,
        Url::parse(OP).unwrap(),
        Url::parse(RP).unwrap(),
    );
    assertion.claimed_id = Some("https://alice.example/".into());
    assertion.identity = Some("https://alice.example/".into());
    assertion.assoc_handle = Some(handle.into());
    assertion
}

/// Sign an assertion created at `created`, bypassing the time stamp of the sending channel.
fn signed_at(pair: &Pair, created: Time) -> Vec<(String, String)> {
    let store = Arc::new(AssociationMap::new());
    store.store(SHARED_ASSOCIATIONS, pair.association.clone()).unwrap();
    let signing = SigningElement::provider(store, &SecuritySettings::default());

    let mut sent = assertion(&pair.handle);
    sent.set_created(created);
    sent.set_nonce("abcdefgh".into());
    signing.prepare_for_sending(&mut sent).unwrap();
    pairs(&sent)
}

fn redirect(response: IndirectResponse) -> Url {
    match response {
        IndirectResponse::Redirect(url) => url,
        other => panic!("Expected a redirect, got {:?}", other),
    }
}

#[test]
fn signed_assertion_round_trip() {
    let pair = pair();
    let mut sent = assertion(&pair.handle);
    let url = redirect(
        pair.provider
            .prepare_indirect(&mut sent, &Url::parse(RP).unwrap())
            .unwrap(),
    );
    assert!(url.as_str().starts_with(RP));
    assert!(sent.sig.is_some());

    match pair.relying_party.read_from_url(&url).unwrap() {
        Some(IncomingMessage::PositiveAssertion(received)) => {
            assert_eq!(received.claimed_id.as_deref(), Some("https://alice.example/"));
            assert_eq!(received.assoc_handle.as_deref(), Some(pair.handle.as_str()));
            assert_eq!(received.op_endpoint.as_ref().map(Url::as_str), Some(OP));
        }
        other => panic!("Expected a positive assertion, got {:?}", other),
    }
}

#[test]
fn replayed_assertion() {
    let pair = pair();
    let mut sent = assertion(&pair.handle);
    let url = redirect(
        pair.provider
            .prepare_indirect(&mut sent, &Url::parse(RP).unwrap())
            .unwrap(),
    );

    assert!(pair.relying_party.read_from_url(&url).unwrap().is_some());
    let err = pair.relying_party.read_from_url(&url).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Replayed);
}

#[test]
fn maximum_message_age() {
    let pair = pair();
    let age = SecuritySettings::default().maximum_message_age();

    let fresh = signed_at(&pair, Utc::now() - age + Duration::seconds(30));
    match pair.relying_party.read_from_request(&fresh) {
        Ok(Some(IncomingMessage::PositiveAssertion(_))) => (),
        other => panic!("Expected the assertion to be accepted, got {:?}", other),
    }

    let stale = signed_at(&pair, Utc::now() - age - Duration::seconds(1));
    match pair.relying_party.read_from_request(&stale) {
        Err(err @ ProtocolError::ExpiredMessage { .. }) => {
            assert_eq!(err.kind(), ErrorKind::Expired)
        }
        other => panic!("Expected the assertion to be expired, got {:?}", other),
    }
}

#[test]
fn unsigned_extension() {
    let pair = pair();
    let mut sent = assertion(&pair.handle);
    let url = redirect(
        pair.provider
            .prepare_indirect(&mut sent, &Url::parse(RP).unwrap())
            .unwrap(),
    );

    let mut forged = url.clone();
    forged
        .query_pairs_mut()
        .append_pair("openid.sreg.email", "mallory@example.com");
    let err = pair.relying_party.read_from_url(&forged).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSignature);

    // The genuine assertion is still accepted afterwards.
    assert!(pair.relying_party.read_from_url(&url).unwrap().is_some());
}

#[test]
fn tampered_assertion() {
    let pair = pair();
    let mut sent = assertion(&pair.handle);
    let url = redirect(
        pair.provider
            .prepare_indirect(&mut sent, &Url::parse(RP).unwrap())
            .unwrap(),
    );

    let mut tampered = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| match key.as_ref() {
            "openid.identity" => (key.into_owned(), "https://mallory.example/".to_string()),
            _ => (key.into_owned(), value.into_owned()),
        })
        .collect();
    tampered.query_pairs_mut().clear().extend_pairs(pairs);

    let err = pair.relying_party.read_from_url(&tampered).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSignature);
}

#[test]
fn form_post_above_threshold() {
    let settings = SecuritySettings::default();
    let store = Arc::new(AssociationMap::new());
    let provider = crate::openid::channel(
        signing::Role::Provider,
        &settings,
        store,
        Box::new(NonceMap::new(settings.maximum_message_age())),
        None,
    )
    .unwrap()
    .with_get_to_post_threshold(64);

    let mut sent = assertion("unknown");
    sent.identity = Some("https://alice.example/?a=1&b=\"2\"".into());
    sent.claimed_id = sent.identity.clone();

    match provider.prepare_indirect(&mut sent, &Url::parse(RP).unwrap()).unwrap() {
        IndirectResponse::FormPost { action, fields, html } => {
            assert_eq!(action.as_str(), RP);
            assert!(fields.iter().any(|(key, _)| key == "openid.sig"));
            // The unknown handle was replaced by a private association.
            assert!(fields
                .iter()
                .any(|(key, value)| key == "openid.invalidate_handle" && value == "unknown"));
            assert!(html.contains("https://alice.example/?a=1&amp;b=&quot;2&quot;"));
            assert!(!html.contains("b=\"2\""));
        }
        other => panic!("Expected a form post, got {:?}", other),
    }
}

#[test]
fn escapes_markup() {
    assert_eq!(escape_html("<a href='x'>&</a>"), "&lt;a href=&#39;x&#39;&gt;&amp;&lt;/a&gt;");
    assert_eq!(escape_html("plain"), "plain");
}

#[test]
fn missing_replay_protection() {
    let settings = SecuritySettings::default();
    let elements: Vec<Box<dyn BindingElement>> = vec![
        Box::new(ExpirationElement::from_settings(&settings)),
        Box::new(SigningElement::provider(Arc::new(AssociationMap::new()), &settings)),
    ];

    match Channel::new(OpenIdFactory::new(), elements) {
        Err(err) => assert_eq!(err.kind(), ErrorKind::Configuration),
        Ok(_) => panic!("Channel accepted a factory it can not protect"),
    }
}

#[test]
fn duplicate_parameters() {
    let pair = pair();
    let url = Url::parse(&format!(
        "{}?openid.mode=id_res&openid.mode=cancel&openid.ns={}",
        RP,
        crate::message::OPENID2_NAMESPACE
    ))
    .unwrap();

    match pair.relying_party.read_from_url(&url) {
        Err(ProtocolError::DuplicateParameter(key)) => assert_eq!(key, "openid.mode"),
        other => panic!("Expected a duplicate parameter error, got {:?}", other),
    }
}

#[test]
fn unrecognized_parameters() {
    let pair = pair();
    let url = Url::parse(&format!("{}?page=2&sort=asc", RP)).unwrap();
    assert!(pair.relying_party.read_from_url(&url).unwrap().is_none());
    assert!(pair
        .relying_party
        .read_from_url(&Url::parse(RP).unwrap())
        .unwrap()
        .is_none());
}

#[test]
fn direct_response_status() {
    let channel = crate::openid::direct_channel(None).unwrap();

    let mut error = DirectErrorResponse::new(Version::V20, "no such thing");
    let response = channel.prepare_direct_response(&mut error).unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(response.content_type, KEY_VALUE_CONTENT_TYPE);
    assert!(String::from_utf8(response.body).unwrap().contains("error:no such thing\n"));

    let mut verified = CheckAuthenticationResponse::new(Version::V20, true, None);
    let response = channel.prepare_direct_response(&mut verified).unwrap();
    assert_eq!(response.status, 200);
    assert!(String::from_utf8(response.body).unwrap().contains("is_valid:true\n"));
}

#[test]
fn transport_must_match() {
    let channel = crate::openid::direct_channel(None).unwrap();
    let mut indirect = NegativeAssertion::cancel(Version::V20);
    let err = channel.prepare_direct_response(&mut indirect).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = channel
        .prepare_indirect(
            &mut DirectErrorResponse::new(Version::V20, "x"),
            &Url::parse(RP).unwrap(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn direct_request_without_fetcher() {
    let channel = crate::openid::direct_channel(None).unwrap();
    let mut request = AssociateRequest::unencrypted(Version::V20, AssociationKind::HmacSha256);
    let err = channel.request(&mut request, &Url::parse(OP).unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let prepared = channel
        .prepare_direct_request(&mut request, &Url::parse(OP).unwrap())
        .unwrap();
    assert_eq!(prepared.content_type, FORM_CONTENT_TYPE);
    assert!(prepared.body.contains("openid.mode=associate"));
    assert!(prepared.body.contains("openid.session_type=no-encryption"));
}

#[test]
fn direct_response_bad_status() {
    let channel = crate::openid::direct_channel(None).unwrap();
    let request = AssociateRequest::unencrypted(Version::V20, AssociationKind::HmacSha256);

    let err = channel
        .read_direct_response(&request, &HttpResponse::new(500, b"error:down\n".to_vec()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);

    let err = channel
        .read_direct_response(&request, &HttpResponse::new(200, b"foo:bar\n".to_vec()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}
