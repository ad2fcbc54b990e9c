//! HTTP access to a managed search cluster
//!
//! [`SearchClient`] is the only capability the convergence engine and the
//! status controller need from a cluster: send a request, get a status code
//! and a body back. [`HttpSearchClient`] implements it with `reqwest` against
//! the cluster's HTTP service; [`ClusterClientFactory`] builds one per
//! cluster from the Secrets the cluster publishes.

use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tracing::debug;
use url::Url;

use crate::kube_utils::get_secret_data;
use crate::Error;

pub use reqwest::Method;

/// Port of the cluster HTTP service
pub const HTTP_PORT: u16 = 9200;
/// Secret key holding the basic-auth user name
pub const USERNAME_KEY: &str = "username";
/// Secret key holding the basic-auth password
pub const PASSWORD_KEY: &str = "password";
/// Secret key holding the PEM encoded CA certificate
pub const CA_CERT_KEY: &str = "ca.crt";

/// Raw answer of the cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
}

impl SearchResponse {
    /// Create a response
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the status code is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issue HTTP requests against one cluster.
///
/// Non-2xx answers are returned as responses, not errors. Only transport
/// failures are errors.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Send `method path` with an optional JSON body
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<SearchResponse, Error>;
}

/// Resolve a [`SearchClient`] for a cluster
#[async_trait]
pub trait ClusterClientFactory: Send + Sync {
    /// Client for the cluster `name` in `namespace`
    async fn client_for(&self, namespace: &str, name: &str)
        -> Result<Arc<dyn SearchClient>, Error>;
}

/// Basic-auth credentials
#[derive(Clone)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Base URL of a cluster's HTTP service
pub fn cluster_http_url(name: &str, namespace: &str) -> String {
    format!("https://{name}-http.{namespace}.svc:{HTTP_PORT}")
}

/// Secret holding the operator's credentials for a cluster
pub fn user_secret_name(name: &str) -> String {
    format!("{name}-search-user")
}

/// Secret holding the public CA of a cluster's HTTP layer
pub fn ca_secret_name(name: &str) -> String {
    format!("{name}-http-certs-public")
}

/// `reqwest` implementation of [`SearchClient`]
pub struct HttpSearchClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Option<Credentials>,
}

impl HttpSearchClient {
    /// Create a client for `base_url`, trusting `ca_pem` in addition to the
    /// system roots when given.
    pub fn new(
        base_url: &str,
        credentials: Option<Credentials>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, Error> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::transport(base_url, format!("invalid base url: {e}")))?;

        let mut builder = reqwest::Client::builder();
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem).map_err(|e| {
                Error::transport(base_url.as_str(), format!("invalid CA certificate: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build().map_err(|e| {
            Error::transport(
                base_url.as_str(),
                format!("failed to build HTTP client: {e}"),
            )
        })?;

        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    /// Absolute URL for an API path
    pub fn url_for(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|e| Error::transport(path, format!("invalid path: {e}")))
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<SearchResponse, Error> {
        let url = self.url_for(path)?;
        debug!(method = %method, url = %url, "Sending request to cluster");

        let mut request = self.http.request(method.clone(), url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(path, format!("{method} failed: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(path, format!("failed to read body: {e}")))?;

        Ok(SearchResponse::new(status, body.to_vec()))
    }
}

/// Builds [`HttpSearchClient`]s from the Secrets a cluster publishes
pub struct KubeClusterClientFactory {
    client: Client,
}

impl KubeClusterClientFactory {
    /// Create a factory reading Secrets with `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn credentials(&self, namespace: &str, name: &str) -> Result<Option<Credentials>, Error> {
        let secret = user_secret_name(name);
        let username = get_secret_data(&self.client, &secret, namespace, USERNAME_KEY).await?;
        let password = get_secret_data(&self.client, &secret, namespace, PASSWORD_KEY).await?;
        match (username, password) {
            (Some(u), Some(p)) => Ok(Some(Credentials {
                username: decode_utf8(&secret, u)?,
                password: decode_utf8(&secret, p)?,
            })),
            _ => Ok(None),
        }
    }
}

fn decode_utf8(secret: &str, raw: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(raw).map_err(|e| {
        Error::serialization_for_kind("Secret", format!("secret {secret} is not UTF-8: {e}"))
    })
}

#[async_trait]
impl ClusterClientFactory for KubeClusterClientFactory {
    async fn client_for(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Arc<dyn SearchClient>, Error> {
        let credentials = self.credentials(namespace, name).await?;
        let ca = get_secret_data(&self.client, &ca_secret_name(name), namespace, CA_CERT_KEY).await?;
        let client = HttpSearchClient::new(
            &cluster_http_url(name, namespace),
            credentials,
            ca.as_deref(),
        )?;
        Ok(Arc::new(client))
    }
}
