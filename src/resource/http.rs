//! Requests, responses and the network boundary for the resource cache.

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors from the network boundary. A non-2xx status is not one of these.
#[derive(Debug, Error)]
pub enum FetchError {
  /// The host could not be reached at all.
  #[error("network unreachable: {url}")]
  Disconnected { url: String },

  #[error("request to {url} failed: {source}")]
  Transport {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("invalid url '{input}': {source}")]
  InvalidUrl {
    input: String,
    #[source]
    source: url::ParseError,
  },

  #[error("failed to build http client: {0}")]
  Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Only fetches for display go through the cache.
  pub fn is_cacheable(&self) -> bool {
    matches!(self, Method::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unsupported method '{}'", other)),
    }
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Head => reqwest::Method::HEAD,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// An outgoing resource request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// Normalized request identity: method plus absolute URL without fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method, url)
  }
}

/// A response as captured from the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  /// Only exact 200 responses are worth keeping.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Anything that can perform a request against the network.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>>;
}

/// reqwest-backed fetcher bound to a site origin
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl HttpFetcher {
  pub fn new(origin: Url, timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(FetchError::Client)?;

    Ok(Self { client, origin })
  }

  pub fn client(&self) -> &reqwest::Client {
    &self.client
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url, FetchError> {
    self.origin.join(path).map_err(|source| FetchError::InvalidUrl {
      input: path.to_string(),
      source,
    })
  }

  /// GET `path` and decode a JSON body. Non-2xx statuses are errors here.
  pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> color_eyre::Result<T> {
    let url = self.resolve(path)?;

    let value = self
      .client
      .get(url.clone())
      .send()
      .await
      .and_then(reqwest::Response::error_for_status)
      .map_err(|source| transport_error(&url, source))?
      .json::<T>()
      .await
      .map_err(|source| transport_error(&url, source))?;

    Ok(value)
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
    async move {
      let mut builder = self
        .client
        .request(request.method.into(), request.url.clone());
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder
        .send()
        .await
        .map_err(|source| transport_error(&request.url, source))?;

      let status = response.status().as_u16();
      let url = response.url().to_string();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|source| transport_error(&request.url, source))?
        .to_vec();

      Ok(Response {
        url,
        status,
        headers,
        body,
      })
    }
    .boxed()
  }
}

fn transport_error(url: &Url, source: reqwest::Error) -> FetchError {
  if source.is_connect() {
    FetchError::Disconnected {
      url: url.to_string(),
    }
  } else {
    FetchError::Transport {
      url: url.to_string(),
      source,
    }
  }
}
