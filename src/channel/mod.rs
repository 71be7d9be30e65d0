//! The channel every protocol message passes through.
//!
//! A channel encodes outgoing messages for their transport and decodes incoming parameters into
//! typed messages, running its binding elements in both directions. Indirect messages become
//! redirects, or auto-submitting forms when the url would grow too long. Direct requests are
//! form encoded POST bodies, and direct responses use the key-value form.
//!
//! Incoming parameters which no message type recognizes are not an error: reading them returns
//! `Ok(None)`. Every message that is returned has passed all binding elements, so its claims can
//! be relied upon.
use std::fmt;
use std::sync::Arc;

use url::Url;

pub mod binding;
pub mod error;
pub mod expiration;
pub mod http;
pub mod replay;
pub mod signing;

#[cfg(test)]
mod tests;

use self::binding::{BindingElement, Pipeline};
use self::error::{ProtocolError, TransportError};
use self::http::{HttpFetcher, HttpResponse};
use crate::message::dictionary::{pairs, MessageDictionary};
use crate::message::factory::MessageFactory;
use crate::message::query::{NormalizedParameter, QueryParameter};
use crate::message::{Message, ReceivedMessage, Transport};
use crate::primitives::kvform::{self, Conformance};

/// Content type of direct requests.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Content type of direct responses.
pub const KEY_VALUE_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Default maximum length of a redirect url.
pub const DEFAULT_GET_TO_POST_THRESHOLD: usize = 2048;

/// An indirect message, ready to be sent through the user agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndirectResponse {
    /// Redirect the user agent to this url.
    Redirect(Url),

    /// Serve a page that posts the fields to the action url.
    FormPost {
        /// The recipient.
        action: Url,
        /// The encoded fields in order.
        fields: Vec<(String, String)>,
        /// A complete HTML page submitting the form on load.
        html: String,
    },
}

/// A response to a direct request, ready to be written by the front-end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectResponse {
    /// 200 for regular responses, 400 for error responses.
    pub status: u16,

    /// The content type of the body.
    pub content_type: &'static str,

    /// The key-value encoded body.
    pub body: Vec<u8>,
}

/// A direct request, ready to be posted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectRequest {
    /// The endpoint of the other party.
    pub url: Url,

    /// The content type of the body.
    pub content_type: &'static str,

    /// The form encoded body.
    pub body: String,
}

/// Sends and receives messages of one protocol.
pub struct Channel<F: MessageFactory> {
    factory: F,
    pipeline: Pipeline,
    get_to_post_threshold: usize,
    fetcher: Option<Arc<dyn HttpFetcher>>,
}

impl<F: MessageFactory> Channel<F> {
    /// Create a channel from a factory and its binding elements.
    ///
    /// Fails if the binding elements are inconsistent or can not provide the protections some
    /// message type of the factory requires. This catches a missing nonce store at startup
    /// instead of letting unprotected messages through later.
    pub fn new(factory: F, elements: Vec<Box<dyn BindingElement>>) -> Result<Self, ProtocolError> {
        let pipeline = Pipeline::new(elements)?;
        let offered = pipeline.offered();

        for (name, required) in factory.protection_requirements() {
            if !offered.covers(required) {
                return Err(ProtocolError::Configuration(format!(
                    "{} requires {} but the channel only offers {}",
                    name, required, offered
                )));
            }
        }

        Ok(Channel {
            factory,
            pipeline,
            get_to_post_threshold: DEFAULT_GET_TO_POST_THRESHOLD,
            fetcher: None,
        })
    }

    /// Send direct requests with this fetcher.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn HttpFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Use form posts for indirect messages whose url would be longer than `threshold`.
    pub fn with_get_to_post_threshold(mut self, threshold: usize) -> Self {
        self.get_to_post_threshold = threshold;
        self
    }

    /// The factory recognizing incoming messages.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Protect an indirect message and encode it for the user agent.
    pub fn prepare_indirect(
        &self,
        message: &mut dyn Message,
        recipient: &Url,
    ) -> Result<IndirectResponse, ProtocolError> {
        expect_transport(message, Transport::Indirect)?;
        let fields = self.prepare_outgoing(message)?;

        let mut url = recipient.clone();
        url.query_pairs_mut().extend_pairs(fields.iter());

        info!("Prepared indirect {} for {}", message.description().name(), recipient);
        if url.as_str().len() <= self.get_to_post_threshold {
            return Ok(IndirectResponse::Redirect(url));
        }

        debug!("Url of {} bytes exceeds the threshold, using a form post", url.as_str().len());
        let html = form_post_html(recipient, &fields);
        Ok(IndirectResponse::FormPost {
            action: recipient.clone(),
            fields,
            html,
        })
    }

    /// Protect a direct response and encode it in the key-value form.
    pub fn prepare_direct_response(
        &self,
        message: &mut dyn Message,
    ) -> Result<DirectResponse, ProtocolError> {
        expect_transport(message, Transport::Direct)?;
        let fields = self.prepare_outgoing(message)?;
        let body = kvform::encode(fields, Conformance::Loose)?;

        info!("Prepared direct {}", message.description().name());
        Ok(DirectResponse {
            status: if message.is_error() { 400 } else { 200 },
            content_type: KEY_VALUE_CONTENT_TYPE,
            body,
        })
    }

    /// Protect a direct request and encode it as a form body.
    pub fn prepare_direct_request(
        &self,
        message: &mut dyn Message,
        endpoint: &Url,
    ) -> Result<DirectRequest, ProtocolError> {
        expect_transport(message, Transport::Direct)?;
        let fields = self.prepare_outgoing(message)?;
        let body = serde_urlencoded::to_string(&fields)
            .map_err(|err| ProtocolError::Malformed(format!("could not encode form: {}", err)))?;

        info!("Prepared direct {} for {}", message.description().name(), endpoint);
        Ok(DirectRequest {
            url: endpoint.clone(),
            content_type: FORM_CONTENT_TYPE,
            body,
        })
    }

    /// Send a direct request and read the response.
    ///
    /// Requires a fetcher. A provider answering with an error response is reported as
    /// `ProtocolError::ErrorResponse` only if the factory does not recognize it as a message; the
    /// OpenID factory does, so callers see the error message itself.
    pub fn request(
        &self,
        message: &mut dyn Message,
        endpoint: &Url,
    ) -> Result<F::Output, ProtocolError> {
        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| ProtocolError::Configuration("the channel has no http fetcher".into()))?;

        let request = self.prepare_direct_request(message, endpoint)?;
        let response = fetcher.post(&request.url, request.content_type, request.body.as_bytes())?;
        self.read_direct_response(&*message, &response)
    }

    /// Decode and verify the parameters of an incoming request.
    ///
    /// Returns `Ok(None)` if the parameters are not a message this channel knows.
    pub fn read_from_request<Q>(&self, parameters: &Q) -> Result<Option<F::Output>, ProtocolError>
    where
        Q: QueryParameter + ?Sized,
    {
        let fields = parameters.normalize();
        if let Some(duplicate) = fields.first_duplicate() {
            warn!("Rejecting parameters with duplicate key {}", duplicate);
            return Err(ProtocolError::DuplicateParameter(duplicate.to_string()));
        }

        let mut received = match self.factory.recognize_request(&fields)? {
            Some(received) => received,
            None => {
                debug!("Parameters not recognized as a message");
                return Ok(None);
            }
        };

        self.process_incoming(received.message_mut(), &fields)?;
        Ok(Some(received))
    }

    /// Decode and verify the query of an url, usually the return url of an indirect message.
    pub fn read_from_url(&self, url: &Url) -> Result<Option<F::Output>, ProtocolError> {
        self.read_from_request(&NormalizedParameter::from_url(url))
    }

    /// Decode and verify the response to a direct request.
    pub fn read_direct_response(
        &self,
        request: &dyn Message,
        response: &HttpResponse,
    ) -> Result<F::Output, ProtocolError> {
        match response.status {
            200 | 400 => (),
            status => return Err(TransportError::Status(status).into()),
        }

        let fields: NormalizedParameter = kvform::decode(&response.body, Conformance::Loose)?
            .into_iter()
            .collect();

        let mut received = self
            .factory
            .recognize_response(request, &fields)?
            .ok_or_else(|| {
                ProtocolError::Malformed(format!(
                    "unrecognized response to {}",
                    request.description().name()
                ))
            })?;

        self.process_incoming(received.message_mut(), &fields)?;
        Ok(received)
    }

    fn prepare_outgoing(
        &self,
        message: &mut dyn Message,
    ) -> Result<Vec<(String, String)>, ProtocolError> {
        self.pipeline.process_outgoing(message, complete)?;
        Ok(pairs(&*message))
    }

    fn process_incoming(
        &self,
        message: &mut dyn Message,
        fields: &NormalizedParameter,
    ) -> Result<(), ProtocolError> {
        MessageDictionary::new(&mut *message).extend(fields.pairs()?)?;
        complete(&*message)?;
        self.pipeline.process_incoming(message)?;
        info!("Received {}", message.description().name());
        Ok(())
    }
}

impl<F: MessageFactory> fmt::Debug for Channel<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("pipeline", &self.pipeline)
            .field("get_to_post_threshold", &self.get_to_post_threshold)
            .field("fetcher", &self.fetcher.is_some())
            .finish()
    }
}

/// Check required fields and cross-field constraints.
fn complete(message: &dyn Message) -> Result<(), ProtocolError> {
    message.description().ensure_required(message)?;
    message.validate()
}

fn expect_transport(message: &dyn Message, transport: Transport) -> Result<(), ProtocolError> {
    if message.transport() == transport {
        Ok(())
    } else {
        Err(ProtocolError::Configuration(format!(
            "{} can not be sent as a {:?} message",
            message.description().name(),
            transport
        )))
    }
}

fn form_post_html(action: &Url, fields: &[(String, String)]) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><title>Continue</title></head>\n\
         <body onload=\"document.forms[0].submit()\">\n",
    );
    html.push_str(&format!(
        "<form method=\"post\" action=\"{}\">\n",
        escape_html(action.as_str())
    ));
    for (name, value) in fields {
        html.push_str(&format!(
            "<input type=\"hidden\" name=\"{}\" value=\"{}\" />\n",
            escape_html(name),
            escape_html(value)
        ));
    }
    html.push_str("<noscript><input type=\"submit\" value=\"Continue\" /></noscript>\n");
    html.push_str("</form>\n</body>\n</html>\n");
    html
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
