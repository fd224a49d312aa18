use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gantry_utils::{RetryConfig, retry_if};
use reqwest::Method;
use serde::de::DeserializeOwned;

use super::{
    ComputeApi, Disk, Firewall, Image, Instance, List, MachineType, Metadata, Network, Operation,
    Subnetwork, Tags, TokenSource, poll_until_done,
};
use crate::{Error, Result};

pub const BASE_URL: &str = "https://compute.googleapis.com/compute/v1/projects";

/// The `wait` endpoint holds a request open for up to two minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(150);

/// Compute Engine v1 over HTTPS.
///
/// Every request is retried with backoff on transport, throttling, auth and
/// server errors; client errors come back on the first attempt.
pub struct GceClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base_url: String,
    retry: RetryConfig,
    poll_interval: Duration,
}

impl GceClient {
    pub fn new(tokens: Arc<dyn TokenSource>, retry: RetryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("gantry/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            tokens,
            base_url: BASE_URL.to_string(),
            retry,
            poll_interval: crate::POLL_INTERVAL,
        })
    }

    /// Point the client at a different endpoint (emulators, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        self.request_as(retry_policy(&method), method, path, query, body)
            .await
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        should_retry: fn(&Error) -> bool,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let label = format!("{method} {path}");
        retry_if(&self.retry, &label, should_retry, || {
            self.request_once(method.clone(), path, query, body)
        })
        .await
    }

    async fn request_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let token = self.tokens.access_token().await?;
        let mut request = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        tracing::debug!(%method, path, "compute api request");
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let message = api_error_message(&text).unwrap_or(text);
        Err(Error::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, &[], None).await
    }

    async fn submit<B: serde::Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Operation> {
        let body = body.map(serde_json::to_value).transpose()?;
        self.request(method, path, &[], body.as_ref()).await
    }

    async fn list_all<T: DeserializeOwned>(&self, path: &str, filter: Option<&str>) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = Vec::new();
            if let Some(filter) = filter {
                query.push(("filter", filter));
            }
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let page: List<T> = self.request(Method::GET, path, &query, None).await?;
            items.extend(page.items);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(items),
            }
        }
    }
}

/// Pull `error.message` out of a Google API error body.
fn api_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl ComputeApi for GceClient {
    async fn get_image(&self, project: &str, name: &str) -> Result<Image> {
        self.get(&format!("{project}/global/images/{name}")).await
    }

    async fn get_image_from_family(&self, project: &str, family: &str) -> Result<Image> {
        self.get(&format!("{project}/global/images/family/{family}"))
            .await
    }

    async fn get_machine_type(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<MachineType> {
        self.get(&format!("{project}/zones/{zone}/machineTypes/{name}"))
            .await
    }

    async fn get_network(&self, project: &str, name: &str) -> Result<Network> {
        self.get(&format!("{project}/global/networks/{name}")).await
    }

    async fn get_subnetwork(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<Subnetwork> {
        self.get(&format!("{project}/regions/{region}/subnetworks/{name}"))
            .await
    }

    async fn get_firewall(&self, project: &str, name: &str) -> Result<Firewall> {
        self.get(&format!("{project}/global/firewalls/{name}")).await
    }

    async fn insert_firewall(&self, project: &str, firewall: &Firewall) -> Result<Operation> {
        self.submit(
            Method::POST,
            &format!("{project}/global/firewalls"),
            Some(firewall),
        )
        .await
    }

    async fn patch_firewall(
        &self,
        project: &str,
        name: &str,
        firewall: &Firewall,
    ) -> Result<Operation> {
        self.submit(
            Method::PATCH,
            &format!("{project}/global/firewalls/{name}"),
            Some(firewall),
        )
        .await
    }

    async fn delete_firewall(&self, project: &str, name: &str) -> Result<Operation> {
        self.submit::<()>(
            Method::DELETE,
            &format!("{project}/global/firewalls/{name}"),
            None,
        )
        .await
    }

    async fn list_firewalls(&self, project: &str, filter: Option<&str>) -> Result<Vec<Firewall>> {
        self.list_all(&format!("{project}/global/firewalls"), filter)
            .await
    }

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation> {
        self.submit(
            Method::POST,
            &format!("{project}/zones/{zone}/instances"),
            Some(instance),
        )
        .await
    }

    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<Instance> {
        self.get(&format!("{project}/zones/{zone}/instances/{name}"))
            .await
    }

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<Operation> {
        self.submit::<()>(
            Method::DELETE,
            &format!("{project}/zones/{zone}/instances/{name}"),
            None,
        )
        .await
    }

    async fn list_instances(&self, project: &str, zone: &str) -> Result<Vec<Instance>> {
        self.list_all(&format!("{project}/zones/{zone}/instances"), None)
            .await
    }

    async fn set_instance_metadata(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        metadata: &Metadata,
    ) -> Result<Operation> {
        self.submit(
            Method::POST,
            &format!("{project}/zones/{zone}/instances/{name}/setMetadata"),
            Some(metadata),
        )
        .await
    }

    async fn set_instance_tags(
        &self,
        project: &str,
        zone: &str,
        name: &str,
        tags: &Tags,
    ) -> Result<Operation> {
        self.submit(
            Method::POST,
            &format!("{project}/zones/{zone}/instances/{name}/setTags"),
            Some(tags),
        )
        .await
    }

    async fn list_disks(&self, project: &str, zone: &str) -> Result<Vec<Disk>> {
        self.list_all(&format!("{project}/zones/{zone}/disks"), None)
            .await
    }

    async fn delete_disk(&self, project: &str, zone: &str, name: &str) -> Result<Operation> {
        self.submit::<()>(
            Method::DELETE,
            &format!("{project}/zones/{zone}/disks/{name}"),
            None,
        )
        .await
    }

    async fn wait_operation(
        &self,
        project: &str,
        operation: &Operation,
        deadline: Duration,
    ) -> Result<Operation> {
        let path = match operation.zone_name() {
            Some(zone) => format!("{project}/zones/{zone}/operations/{}/wait", operation.name),
            None => format!("{project}/global/operations/{}/wait", operation.name),
        };

        // operations/wait is a POST but only reads state
        poll_until_done(operation, deadline, self.poll_interval, || {
            self.request_as(Error::is_retryable, Method::POST, &path, &[], None)
        })
        .await
    }
}

/// Which failures may be retried for `method`.
///
/// An insert or set call that reached the server may have taken effect, so
/// it is only repeated when the request was never accepted.
fn retry_policy(method: &Method) -> fn(&Error) -> bool {
    if method.is_idempotent() {
        Error::is_retryable
    } else {
        Error::is_retryable_before_send
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gce::StaticToken;

    #[test]
    fn api_error_message_reads_google_error_body() {
        let body = r#"{"error": {"code": 404, "message": "The resource 'projects/acme/global/images/nope' was not found", "errors": []}}"#;
        assert_eq!(
            api_error_message(body).as_deref(),
            Some("The resource 'projects/acme/global/images/nope' was not found")
        );
        assert_eq!(api_error_message("<html>bad gateway</html>"), None);
    }

    fn api(status: u16) -> Error {
        Error::Api {
            status,
            message: "backend unavailable".into(),
        }
    }

    async fn attempts(method: Method, status: u16) -> u32 {
        let config = RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        };
        let mut calls = 0;
        let _ = retry_if(&config, "test", retry_policy(&method), || {
            calls += 1;
            async move { Err::<(), _>(api(status)) }
        })
        .await;
        calls
    }

    #[tokio::test]
    async fn inserts_are_not_repeated_after_a_server_error() {
        assert_eq!(attempts(Method::POST, 503).await, 1);
        assert_eq!(attempts(Method::PATCH, 500).await, 1);
        assert_eq!(attempts(Method::POST, 429).await, 4);
    }

    #[tokio::test]
    async fn reads_and_deletes_retry_server_errors() {
        assert_eq!(attempts(Method::GET, 503).await, 4);
        assert_eq!(attempts(Method::DELETE, 502).await, 4);
        assert_eq!(attempts(Method::GET, 400).await, 1);
    }

    #[test]
    fn urls_join_base_and_path() {
        let client = GceClient::new(Arc::new(StaticToken::new("t")), RetryConfig::none())
            .unwrap()
            .with_base_url("http://localhost:8080/compute/v1/projects/");
        assert_eq!(
            client.url("acme/global/networks/default"),
            "http://localhost:8080/compute/v1/projects/acme/global/networks/default"
        );
    }
}
