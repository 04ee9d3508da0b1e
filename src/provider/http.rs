//! Generic REST provider.
//!
//! Binds the provider trait to a resource API of the form
//! `POST /resources/{kind}` and `GET|PATCH|DELETE /resources/{kind}/{id}`.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::Attributes;
use crate::error::{ConvergeError, ProviderError, Result};

use super::adapter::{Provider, ProviderResult, RemoteObject};
use super::schema::SchemaCatalog;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    attributes: &'a Attributes,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    changes: &'a Attributes,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    token: Option<String>,
    catalog: SchemaCatalog,
}

impl HttpProvider {
    /// Creates a new provider for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provider with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                ConvergeError::Provider(ProviderError::transient(format!(
                    "Failed to create HTTP client: {e}"
                )))
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            catalog: SchemaCatalog::builtin(),
        })
    }

    /// Replaces the schema catalog reported by this provider.
    #[must_use]
    pub fn with_catalog(mut self, catalog: SchemaCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    fn collection_url(&self, kind: &str) -> String {
        format!("{}/resources/{kind}", self.endpoint)
    }

    fn object_url(&self, kind: &str, id: &str) -> String {
        format!("{}/resources/{kind}/{id}", self.endpoint)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn send(
        &self,
        kind: &str,
        id: Option<&str>,
        request: RequestBuilder,
    ) -> ProviderResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("Request failed: {e}")))?;

        let status = response.status();
        trace!("{kind} {} -> {status}", id.unwrap_or("-"));

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(body);

        Err(classify_status(status, kind, id, message))
    }

    async fn decode(response: Response) -> ProviderResult<RemoteObject> {
        response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
    }
}

fn classify_status(
    status: StatusCode,
    kind: &str,
    id: Option<&str>,
    message: String,
) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound {
            kind: kind.to_string(),
            id: id.unwrap_or_default().to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::AuthenticationFailed { message }
        }
        StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::transient(format!("rate limited: {message}"))
        }
        s if s.is_server_error() => ProviderError::transient(format!("{s}: {message}")),
        _ => ProviderError::rejected(kind, format!("{status}: {message}")),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    fn schemas(&self) -> SchemaCatalog {
        self.catalog.clone()
    }

    async fn create(&self, kind: &str, attributes: &Attributes) -> ProviderResult<RemoteObject> {
        debug!("POST {}", self.collection_url(kind));
        let request = self
            .client
            .post(self.collection_url(kind))
            .json(&CreateRequest { attributes });
        let response = self.send(kind, None, request).await?;
        Self::decode(response).await
    }

    async fn read(&self, kind: &str, id: &str) -> ProviderResult<RemoteObject> {
        let request = self.client.get(self.object_url(kind, id));
        let response = self.send(kind, Some(id), request).await?;
        Self::decode(response).await
    }

    async fn update(
        &self,
        kind: &str,
        id: &str,
        changes: &Attributes,
    ) -> ProviderResult<RemoteObject> {
        debug!("PATCH {}", self.object_url(kind, id));
        let request = self
            .client
            .patch(self.object_url(kind, id))
            .json(&UpdateRequest { changes });
        let response = self.send(kind, Some(id), request).await?;
        Self::decode(response).await
    }

    async fn delete(&self, kind: &str, id: &str) -> ProviderResult<()> {
        debug!("DELETE {}", self.object_url(kind, id));
        let request = self.client.delete(self.object_url(kind, id));
        self.send(kind, Some(id), request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), Some(String::from("secret"))).expect("client")
    }

    #[tokio::test]
    async fn test_create_posts_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/aws_vpc"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"attributes": {"cidr_block": "10.0.0.0/16"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "vpc-123",
                "attributes": {"cidr_block": "10.0.0.0/16", "arn": "arn:vpc-123"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let attrs = BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]);
        let object = provider(&server).create("aws_vpc", &attrs).await.expect("create");
        assert_eq!(object.id, "vpc-123");
        assert_eq!(object.attributes["arn"], json!("arn:vpc-123"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/aws_vpc/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resources/aws_vpc/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/resources/aws_vpc/bad"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"message": "invalid cidr"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/resources/aws_vpc/denied"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let p = provider(&server);
        assert!(p.read("aws_vpc", "gone").await.expect_err("404").is_not_found());
        assert!(p.read("aws_vpc", "busy").await.expect_err("503").is_retryable());

        let err = p
            .update("aws_vpc", "bad", &BTreeMap::new())
            .await
            .expect_err("422");
        match err {
            ProviderError::Rejected { message, .. } => assert!(message.contains("invalid cidr")),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = p.delete("aws_vpc", "denied").await.expect_err("403");
        assert!(matches!(err, ProviderError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let p = HttpProvider::with_timeout("http://127.0.0.1:9", None, 1).expect("client");
        let err = p.read("aws_vpc", "x").await.expect_err("connection refused");
        assert!(err.is_retryable());
    }
}
