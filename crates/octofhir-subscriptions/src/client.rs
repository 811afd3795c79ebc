//! Minimal FHIR REST client seam.
//!
//! The subscription manager only needs three interactions with the FHIR
//! server: create a Subscription resource, invoke the
//! `$get-ws-binding-token` operation, and delete the Subscription on
//! teardown. [`FhirClient`] is that seam; [`HttpFhirClient`] is the stock
//! reqwest implementation.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SubscriptionError, SubscriptionResult};

/// The REST surface the subscription manager depends on. Paths are relative
/// to the FHIR base URL (`"Subscription"`,
/// `"Subscription/{id}/$get-ws-binding-token"`).
#[async_trait]
pub trait FhirClient: Send + Sync {
    /// POST a resource to its type endpoint, returning the created resource.
    async fn create_resource(&self, resource: Value) -> SubscriptionResult<Value>;

    /// GET a path, returning the response resource.
    async fn get(&self, path: &str) -> SubscriptionResult<Value>;

    /// DELETE a path.
    async fn delete(&self, path: &str) -> SubscriptionResult<()>;
}

/// [`FhirClient`] backed by reqwest, with optional bearer authentication.
pub struct HttpFhirClient {
    http: reqwest::Client,
    base_url: url::Url,
    bearer_token: Option<String>,
}

impl HttpFhirClient {
    /// Create a client for the given FHIR base URL. A trailing slash is
    /// appended if missing so that relative paths join correctly.
    pub fn new(base_url: &str, bearer_token: Option<String>) -> SubscriptionResult<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = url::Url::parse(&normalized)
            .map_err(|e| SubscriptionError::InvalidBaseUrl(e.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            bearer_token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> SubscriptionResult<reqwest::RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| SubscriptionError::InvalidBaseUrl(e.to_string()))?;
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }
}

#[async_trait]
impl FhirClient for HttpFhirClient {
    async fn create_resource(&self, resource: Value) -> SubscriptionResult<Value> {
        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SubscriptionError::InvalidResponse("resource is missing resourceType".to_string())
            })?
            .to_string();
        let response = self
            .request(reqwest::Method::POST, &resource_type)?
            .header("Content-Type", "application/fhir+json")
            .json(&resource)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn get(&self, path: &str) -> SubscriptionResult<Value> {
        let response = self
            .request(reqwest::Method::GET, path)?
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn delete(&self, path: &str) -> SubscriptionResult<()> {
        self.request(reqwest::Method::DELETE, path)?
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
