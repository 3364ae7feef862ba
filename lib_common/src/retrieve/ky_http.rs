//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest` for hypervisor
//! management APIs: a fixed base URL, token authentication, a hard request
//! timeout and optional acceptance of self-signed certificates, which is the
//! norm for freshly installed hosts.
//!
//! Every call is a single attempt. Whether and when to try again is decided
//! by the caller.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Prefix of the token authorization scheme used by the hypervisor API.
pub const PVE_TOKEN_SCHEME: &str = "PVEAPIToken";

/// A standardized container for API responses.
///
/// Wraps the deserialized body together with the HTTP transaction metadata.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw body returned by the server when the status was not 2xx.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Failures below the HTTP status level.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The base URL or request path could not form an absolute URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// The API token contains characters not allowed in a header.
    #[error("invalid authorization header value")]
    InvalidToken,
    /// The underlying client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
    /// The request could not be sent or the body could not be read.
    #[error("transport failure: {0}")]
    Transport(#[source] reqwest::Error),
    /// A 2xx body was not the expected JSON document.
    #[error("response body could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Connection options for an [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Upper bound on connect plus full response read.
    pub timeout: Duration,
    /// Accept self-signed or otherwise unverifiable TLS certificates.
    pub accept_invalid_certs: bool,
    /// Value of the `Authorization` header sent with every request.
    pub authorization: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            accept_invalid_certs: false,
            authorization: None,
        }
    }
}

/// Builds the `Authorization` header value for a hypervisor API token.
pub fn pve_token_authorization(token_id: &str, secret: &str) -> String {
    format!("{}={}={}", PVE_TOKEN_SCHEME, token_id, secret)
}

/// A flexible asynchronous HTTP client.
///
/// Handles base URL joining and authentication; connection pooling comes
/// from the shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    /// The underlying connection-pooling client.
    inner: reqwest::Client,
    /// The base URL to which all relative paths are joined. Always ends in `/`.
    base_url: Url,
    /// Pre-validated authorization header.
    authorization: Option<HeaderValue>,
}

impl ApiClient {
    /// Creates a new `ApiClient`.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL, e.g. `https://10.0.0.5:8006`.
    /// * `options` - Timeout, TLS and authentication settings.
    pub fn new(base_url: &str, options: ClientOptions) -> Result<Self, HttpError> {
        let mut url = Url::parse(base_url).map_err(|e| HttpError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if url.cannot_be_a_base() {
            return Err(HttpError::InvalidUrl(base_url.to_string()));
        }
        // A base without a trailing slash would lose its last segment on join.
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let authorization = options
            .authorization
            .as_deref()
            .map(|value| {
                let mut header = HeaderValue::from_str(value).map_err(|_| HttpError::InvalidToken)?;
                header.set_sensitive(true);
                Ok::<_, HttpError>(header)
            })
            .transpose()?;

        let inner = reqwest::Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .user_agent(concat!("nodes-dashboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(HttpError::Build)?;

        Ok(Self {
            inner,
            base_url: url,
            authorization,
        })
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the base URL. Leading slashes are ignored so
    /// a base path prefix is never discarded.
    pub fn url_for(&self, path: &str) -> Result<Url, HttpError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| HttpError::InvalidUrl(format!("{}: {}", path, e)))
    }

    /// Performs a GET request and decodes a JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, HttpError> {
        self.request(Method::GET, path).await
    }

    /// Performs a body-less request and handles the response.
    ///
    /// A non-2xx status is not an error here: it is returned in the
    /// `ApiResponse` with the raw body so the caller can classify it.
    pub async fn request<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<ApiResponse<T>, HttpError> {
        // 1. Construct the full absolute URL
        let full_url = self.url_for(path)?;
        let mut req = self.inner.request(method, full_url);

        // 2. Inject authentication if configured
        if let Some(value) = &self.authorization {
            req = req.header(AUTHORIZATION, value.clone());
        }

        // 3. Execute the request and capture response metadata
        let response = req.send().await.map_err(HttpError::Transport)?;
        let status = response.status();
        let headers = response.headers().clone();

        // 4. Read the whole body within the same timeout
        let body = response.text().await.map_err(HttpError::Transport)?;
        if status.is_success() {
            let data = serde_json::from_str::<T>(&body).map_err(HttpError::Decode)?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers,
            })
        } else {
            Ok(ApiResponse {
                data: None,
                error_body: Some(body),
                status: status.as_u16(),
                success: false,
                headers,
            })
        }
    }
}
