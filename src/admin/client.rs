//! HTTP implementation of the admin client.
//!
//! Transport concerns live here: bounded jittered retries, JSON coding,
//! the environment header, and classification of non-2xx responses into
//! NotFound / MethodNotAllowed / Unexpected with the body's `error` field
//! preserved in the surfaced message.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::retry::{retry_transient, RetryConfig};

use super::{
    AdminClient, AdminError, BootstrapStatus, NamespaceListResponse, NamespaceOptions,
    NamespaceRequest, Placement, PlacementAddRequest, PlacementInitRequest, PlacementInstance,
    PlacementResponse, SetWeightRequest, ENVIRONMENT_HEADER,
};

const PLACEMENT_PATH: &str = "/api/v1/services/m3db/placement";
const NAMESPACE_PATH: &str = "/api/v1/services/m3db/namespace";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BOOTSTRAP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Admin client backed by reqwest against one cluster's coordinator
pub struct AdminClientImpl {
    http: reqwest::Client,
    base_url: String,
    environment: Option<String>,
    retry: RetryConfig,
}

impl AdminClientImpl {
    /// Create a client for the coordinator at `base_url`
    /// (e.g. `http://cluster-coordinator.ns.svc.cluster.local:7201`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            http,
            base_url: trim_trailing_slash(base_url.into()),
            environment: None,
            retry: RetryConfig::limited(3),
        }
    }

    /// Send the environment header on every request
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Override the transport retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Perform one request, returning status and raw body.
    ///
    /// Transport failures and 5xx responses surface as transient errors
    /// and are retried by policy; any other status is a definitive answer
    /// returned to the caller for classification.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, Vec<u8>), AdminError> {
        let op = format!("{method} {url}");
        retry_transient(&self.retry, &op, || {
            let method = method.clone();
            let body = body.clone();
            async move {
                let mut request = self
                    .http
                    .request(method, url)
                    .header("Content-Type", "application/json");
                if let Some(env) = &self.environment {
                    request = request.header(ENVIRONMENT_HEADER, env);
                }
                if let Some(body) = body {
                    request = request.json(&body);
                }

                let response = request.send().await.map_err(AdminError::Transport)?;
                let status = response.status();
                let bytes = response
                    .bytes()
                    .await
                    .map_err(AdminError::Transport)?
                    .to_vec();

                if status.is_server_error() {
                    return Err(AdminError::Unexpected {
                        status: status.as_u16(),
                        message: parse_error_body(&bytes),
                    });
                }
                Ok((status, bytes))
            }
        })
        .await
    }

    async fn request<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R, AdminError> {
        let url = format!("{}{}", self.base_url, path);
        let body = body.map(serde_json::to_value).transpose()?;
        let (status, bytes) = self.send(method, &url, body).await?;

        if !status.is_success() {
            return Err(classify(status, &bytes));
        }

        debug!(url = %url, status = %status, "admin response received");
        if bytes.is_empty() {
            // Coordinator mutations may answer with an empty body
            serde_json::from_slice(b"{}").map_err(AdminError::Decode)
        } else {
            serde_json::from_slice(&bytes).map_err(AdminError::Decode)
        }
    }

    async fn request_unit<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), AdminError> {
        let url = format!("{}{}", self.base_url, path);
        let body = body.map(serde_json::to_value).transpose()?;
        let (status, bytes) = self.send(method, &url, body).await?;

        if !status.is_success() {
            return Err(classify(status, &bytes));
        }
        debug!(url = %url, status = %status, "admin response received");
        Ok(())
    }
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

/// Map a non-2xx status to the error taxonomy, preserving the body's
/// JSON `error` field in the message.
fn classify(status: StatusCode, body: &[u8]) -> AdminError {
    let message = parse_error_body(body);
    match status {
        StatusCode::NOT_FOUND => AdminError::NotFound(message),
        StatusCode::METHOD_NOT_ALLOWED => AdminError::MethodNotAllowed(message),
        _ => AdminError::Unexpected {
            status: status.as_u16(),
            message,
        },
    }
}

fn parse_error_body(body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: String,
    }
    serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_default()
}

fn is_already_exists(err: &AdminError) -> bool {
    match err {
        AdminError::Unexpected { status, message } => {
            *status == 409 || message.contains("already exists")
        }
        _ => false,
    }
}

#[async_trait]
impl AdminClient for AdminClientImpl {
    async fn init_placement(&self, request: &PlacementInitRequest) -> Result<(), AdminError> {
        let path = format!("{PLACEMENT_PATH}/init");
        match self
            .request_unit(Method::POST, &path, Some(request))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_already_exists(&err) => {
                // Idempotent success iff the existing placement carries the
                // same instance set we tried to initialize with.
                let existing = self.get_placement().await?.ok_or(err)?;
                let requested: std::collections::BTreeSet<&str> =
                    request.instances.iter().map(|i| i.id.as_str()).collect();
                let actual: std::collections::BTreeSet<&str> =
                    existing.instances.keys().map(String::as_str).collect();
                if requested == actual {
                    Ok(())
                } else {
                    Err(AdminError::Conflict(format!(
                        "placement already initialized with a different instance set: {:?}",
                        actual
                    )))
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn get_placement(&self) -> Result<Option<Placement>, AdminError> {
        match self
            .request::<(), PlacementResponse>(Method::GET, PLACEMENT_PATH, None)
            .await
        {
            Ok(resp) => Ok(Some(resp.placement)),
            Err(AdminError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn delete_placement(&self) -> Result<(), AdminError> {
        match self
            .request_unit::<()>(Method::DELETE, PLACEMENT_PATH, None)
            .await
        {
            Ok(()) | Err(AdminError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn add_instances(
        &self,
        instances: Vec<PlacementInstance>,
    ) -> Result<Placement, AdminError> {
        let request = PlacementAddRequest { instances };
        let resp: PlacementResponse = self
            .request(Method::POST, PLACEMENT_PATH, Some(&request))
            .await?;
        Ok(resp.placement)
    }

    async fn remove_instance(&self, id: &str) -> Result<(), AdminError> {
        let path = format!("{PLACEMENT_PATH}/{id}");
        self.request_unit::<()>(Method::DELETE, &path, None).await
    }

    async fn set_instance_weight(&self, id: &str, weight: u32) -> Result<(), AdminError> {
        let path = format!("{PLACEMENT_PATH}/{id}/weight");
        let request = SetWeightRequest { weight };
        self.request_unit(Method::POST, &path, Some(&request)).await
    }

    async fn create_namespace(&self, request: &NamespaceRequest) -> Result<(), AdminError> {
        match self
            .request_unit(Method::POST, NAMESPACE_PATH, Some(request))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_already_exists(&err) => {
                let registered = self.list_namespaces().await?;
                match registered.get(&request.name) {
                    Some(options) if *options == request.options => Ok(()),
                    Some(_) => Err(AdminError::Conflict(format!(
                        "namespace '{}' exists with different options",
                        request.name
                    ))),
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), AdminError> {
        let path = format!("{NAMESPACE_PATH}/{name}");
        match self.request_unit::<()>(Method::DELETE, &path, None).await {
            Ok(()) | Err(AdminError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn list_namespaces(&self) -> Result<BTreeMap<String, NamespaceOptions>, AdminError> {
        let resp: NamespaceListResponse =
            self.request::<(), _>(Method::GET, NAMESPACE_PATH, None).await?;
        Ok(resp.registry.namespaces)
    }

    async fn node_bootstrapped(&self, endpoint: &str) -> Result<BootstrapStatus, AdminError> {
        let url = format!("http://{endpoint}/bootstrapped");
        let result = self
            .http
            .get(&url)
            .timeout(BOOTSTRAP_PROBE_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => Ok(BootstrapStatus::Bootstrapped),
            Ok(resp) => {
                debug!(endpoint, status = %resp.status(), "node not bootstrapped");
                Ok(BootstrapStatus::NotBootstrapped)
            }
            Err(err) => {
                warn!(endpoint, error = %err, "bootstrap probe unreachable");
                Ok(BootstrapStatus::Unknown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Transient;

    #[test]
    fn classify_preserves_body_error_field() {
        let err = classify(
            StatusCode::NOT_FOUND,
            br#"{"error":"placement not found"}"#,
        );
        match err {
            AdminError::NotFound(msg) => assert_eq!(msg, "placement not found"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn classify_method_not_allowed() {
        let err = classify(StatusCode::METHOD_NOT_ALLOWED, b"");
        assert!(matches!(err, AdminError::MethodNotAllowed(_)));
    }

    #[test]
    fn classify_other_statuses_keep_code_and_message() {
        let err = classify(StatusCode::BAD_REQUEST, br#"{"error":"invalid shard count"}"#);
        match err {
            AdminError::Unexpected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "invalid shard count");
            }
            other => panic!("expected Unexpected, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_error_body_yields_empty_message() {
        let err = classify(StatusCode::BAD_GATEWAY, b"<html>nope</html>");
        match err {
            AdminError::Unexpected { status, message } => {
                assert_eq!(status, 502);
                assert!(message.is_empty());
            }
            other => panic!("expected Unexpected, got {other:?}"),
        }
    }

    #[test]
    fn already_exists_detection() {
        assert!(is_already_exists(&AdminError::Unexpected {
            status: 409,
            message: String::new(),
        }));
        assert!(is_already_exists(&AdminError::Unexpected {
            status: 400,
            message: "placement already exists".to_string(),
        }));
        assert!(!is_already_exists(&AdminError::NotFound(String::new())));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = AdminClientImpl::new("http://coordinator:7201/");
        assert_eq!(client.base_url, "http://coordinator:7201");
    }

    #[test]
    fn transient_classification_drives_requeue() {
        assert!(AdminError::Unexpected {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!AdminError::Unexpected {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!AdminError::Conflict(String::new()).is_transient());
    }
}
