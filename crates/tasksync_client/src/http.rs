//! HTTP transport for REST calls.
//!
//! The actual HTTP client is abstracted via [`HttpClient`] so the auth layer
//! and the reconciler can be driven by an in-process fake in tests.
//! [`ReqwestClient`] is the production implementation.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tasksync_protocol::{AuthTokens, ErrorBody, RefreshRequest};

/// HTTP method of an API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        })
    }
}

/// A request against the REST API, independent of credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the base URL, e.g. `/api/tasks/3`.
    pub path: String,
    /// JSON body.
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// Creates a request without a body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    /// Attaches a JSON body.
    pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> ClientResult<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }
}

/// Status and raw body of a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Creates a response with a JSON body.
    pub fn json<T: Serialize + ?Sized>(status: u16, body: &T) -> ClientResult<Self> {
        Ok(Self {
            status,
            body: serde_json::to_vec(body)?,
        })
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns true if the server rejected the credential.
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// Decodes a successful body, or turns an error status into
    /// [`ClientError::Mutation`] carrying the server's message.
    pub fn into_result<T: DeserializeOwned>(self) -> ClientResult<T> {
        if self.is_success() {
            return Ok(serde_json::from_slice(&self.body)?);
        }
        Err(self.into_error())
    }

    /// Converts an error response into a client error.
    pub fn into_error(self) -> ClientError {
        if self.is_unauthorized() {
            return ClientError::Unauthorized;
        }
        let message = serde_json::from_slice::<ErrorBody>(&self.body)
            .map(|body| body.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.body).into_owned());
        ClientError::Mutation {
            status: self.status,
            message,
        }
    }
}

/// HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Executes a request, attaching `access_token` as a bearer credential
    /// when present. Only network failures are errors; every HTTP status is
    /// returned as a response.
    async fn execute(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> ClientResult<ApiResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl ReqwestClient {
    /// Creates a client for the configured server.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::transport_fatal(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> ClientResult<ApiResponse> {
        let url = self.config.endpoint(&request.path)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, url);
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::transport_retryable(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::transport_retryable(e.to_string()))?;

        tracing::trace!(method = %request.method, path = %request.path, status, "api call");
        Ok(ApiResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Exchanges a refresh token for a new credential pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
    /// Performs the refresh call.
    async fn refresh(&self, refresh_token: &str) -> ClientResult<AuthTokens>;
}

/// [`TokenRefresher`] calling `POST /api/auth/refresh`.
pub struct HttpRefresher<C: HttpClient> {
    http: std::sync::Arc<C>,
}

impl<C: HttpClient> HttpRefresher<C> {
    /// Creates a refresher over an HTTP client.
    pub fn new(http: std::sync::Arc<C>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl<C: HttpClient> TokenRefresher for HttpRefresher<C> {
    async fn refresh(&self, refresh_token: &str) -> ClientResult<AuthTokens> {
        let request = ApiRequest::new(Method::Post, "/api/auth/refresh").with_json(
            &RefreshRequest {
                refresh_token: refresh_token.to_string(),
            },
        )?;
        // The refresh endpoint takes no access token.
        let response = self.http.execute(&request, None).await?;
        if !response.is_success() {
            return Err(ClientError::SessionExpired(format!(
                "refresh rejected with status {}",
                response.status
            )));
        }
        response.into_result()
    }
}
