//! The HTTP client a channel sends direct messages with.
//!
//! The library does not ship a client. Hosts implement `HttpFetcher` over whatever client their
//! front-end already uses, and surface its failures as a `TransportError` so that they can be
//! told apart from a provider rejecting a message.
use url::Url;

use super::error::TransportError;

/// A response to a direct request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// The status code.
    pub status: u16,

    /// Header names and values, in the order received.
    pub headers: Vec<(String, String)>,

    /// The raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A response with status and body but no headers.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        HttpResponse {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// The first value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Performs HTTP requests on behalf of a channel.
pub trait HttpFetcher: Send + Sync {
    /// Fetch a resource.
    fn get(&self, url: &Url) -> Result<HttpResponse, TransportError>;

    /// Post a body of the given content type.
    fn post(
        &self,
        url: &Url,
        content_type: &str,
        body: &[u8],
    ) -> Result<HttpResponse, TransportError>;
}

impl<'a, F: HttpFetcher + ?Sized> HttpFetcher for &'a F {
    fn get(&self, url: &Url) -> Result<HttpResponse, TransportError> {
        (**self).get(url)
    }

    fn post(
        &self,
        url: &Url,
        content_type: &str,
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        (**self).post(url, content_type, body)
    }
}

impl<F: HttpFetcher + ?Sized> HttpFetcher for Box<F> {
    fn get(&self, url: &Url) -> Result<HttpResponse, TransportError> {
        (**self).get(url)
    }

    fn post(
        &self,
        url: &Url,
        content_type: &str,
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        (**self).post(url, content_type, body)
    }
}

impl<F: HttpFetcher + ?Sized> HttpFetcher for std::sync::Arc<F> {
    fn get(&self, url: &Url) -> Result<HttpResponse, TransportError> {
        (**self).get(url)
    }

    fn post(
        &self,
        url: &Url,
        content_type: &str,
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        (**self).post(url, content_type, body)
    }
}
