// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP cloud provider client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::traits::*;

/// Cloud API connection settings.
#[derive(Debug, Clone)]
pub struct HttpCloudConfig {
    /// API base URL, e.g. `https://api.example-cloud.com/v1`.
    pub base_url: String,
    /// Bearer token.
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpCloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example-cloud.com/v1".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Deserialize)]
struct InstanceEnvelope {
    instance: CloudInstance,
}

#[derive(Deserialize)]
struct Ipv4Envelope {
    #[serde(default)]
    ipv4s: Vec<Ipv4Address>,
}

/// reqwest-backed [`CloudProvider`].
pub struct HttpCloudProvider {
    client: reqwest::Client,
    config: HttpCloudConfig,
}

impl HttpCloudProvider {
    /// Create a client.
    pub fn new(config: HttpCloudConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CloudError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, request: reqwest::RequestBuilder, id: &str) -> Result<reqwest::Response> {
        let response = request
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| CloudError::Http(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(id.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CloudProvider for HttpCloudProvider {
    async fn create_instance(&self, spec: &CreateInstanceSpec) -> Result<CloudInstance> {
        let request = self.client.post(self.url("/instances")).json(spec);
        let response = self.send(request, &spec.label).await?;
        let envelope: InstanceEnvelope = Self::decode(response).await?;

        debug!(cloud_instance_id = %envelope.instance.id, region = %spec.region, plan = %spec.plan, "Cloud instance created");
        Ok(envelope.instance)
    }

    async fn get_instance(&self, id: &str) -> Result<CloudInstance> {
        let request = self.client.get(self.url(&format!("/instances/{}", id)));
        let response = self.send(request, id).await?;
        let envelope: InstanceEnvelope = Self::decode(response).await?;
        Ok(envelope.instance)
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        let request = self.client.delete(self.url(&format!("/instances/{}", id)));
        self.send(request, id).await?;
        debug!(cloud_instance_id = %id, "Cloud instance deleted");
        Ok(())
    }

    async fn list_ipv4(&self, id: &str) -> Result<Vec<Ipv4Address>> {
        let request = self.client.get(self.url(&format!("/instances/{}/ipv4", id)));
        let response = self.send(request, id).await?;
        let envelope: Ipv4Envelope = Self::decode(response).await?;
        Ok(envelope.ipv4s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpCloudProvider {
        HttpCloudProvider::new(HttpCloudConfig {
            base_url: server.uri(),
            api_key: "cloud-token".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances"))
            .and(header("Authorization", "Bearer cloud-token"))
            .and(body_partial_json(serde_json::json!({
                "region": "fra",
                "plan": "small",
                "enable_ipv6": true,
                "label": "user-7",
                "snapshot_id": "snap-1"
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
                "instance": {"id": "inst-1", "main_ip": "0.0.0.0", "date_created": "2025-03-01T12:00:00+00:00"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let instance = provider(&server)
            .create_instance(&CreateInstanceSpec {
                region: "fra".to_string(),
                plan: "small".to_string(),
                enable_ipv6: true,
                user_data: "Zm9v".to_string(),
                label: "user-7".to_string(),
                snapshot_id: Some("snap-1".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(instance.id, "inst-1");
        assert!(instance.usable_main_ip().is_none());
        assert!(instance.created_at().is_some());
    }

    #[tokio::test]
    async fn test_get_instance_and_ipv4s() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instances/inst-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "instance": {"id": "inst-1", "main_ip": "203.0.113.7"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/instances/inst-1/ipv4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ipv4s": [{"ip": "203.0.113.7", "netmask": "255.255.254.0", "type": "main_ip"}]
            })))
            .mount(&server)
            .await;

        let cloud = provider(&server);
        let instance = cloud.get_instance("inst-1").await.unwrap();
        assert_eq!(instance.usable_main_ip(), Some("203.0.113.7"));

        let ips = cloud.list_ipv4("inst-1").await.unwrap();
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].kind.as_deref(), Some("main_ip"));
    }

    #[tokio::test]
    async fn test_delete_not_found_is_distinguished() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/instances/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/instances/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/instances/ok"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let cloud = provider(&server);
        assert!(cloud.delete_instance("gone").await.unwrap_err().is_not_found());
        assert!(matches!(
            cloud.delete_instance("broken").await,
            Err(CloudError::Status { status: 500, .. })
        ));
        cloud.delete_instance("ok").await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instances/inst-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        assert!(matches!(
            provider(&server).get_instance("inst-1").await,
            Err(CloudError::Decode(_))
        ));
    }
}
