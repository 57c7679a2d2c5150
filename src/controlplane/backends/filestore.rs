//! Filestore REST Client
//!
//! Talks to the Filestore `v1beta1` REST surface. Every mutation returns the
//! long-running operation without waiting on it.

use crate::config::FilestoreConfig;
use crate::domain::model::{
    InstanceKey, MultishareInstance, Operation, ResourceState, Share, ShareKey, GIB,
};
use crate::domain::ports::FilestoreService;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client as HttpClient, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Wire Types
// =============================================================================

/// Filestore encodes int64 fields as JSON strings
mod int64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkConfig {
    #[serde(default)]
    network: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reserved_ip_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connect_mode: Option<String>,
    #[serde(default, skip_serializing)]
    ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceResource {
    #[serde(default, skip_serializing)]
    name: String,
    #[serde(default)]
    tier: String,
    #[serde(default)]
    networks: Vec<NetworkConfig>,
    #[serde(default, with = "int64")]
    capacity_gb: u64,
    #[serde(default, with = "int64", skip_serializing)]
    capacity_step_size_gb: u64,
    #[serde(default, with = "int64")]
    max_share_count: u64,
    #[serde(default)]
    multi_share_enabled: bool,
    #[serde(default, skip_serializing)]
    state: ResourceState,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareResource {
    #[serde(default, skip_serializing)]
    name: String,
    #[serde(default, with = "int64")]
    capacity_gb: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    mount_name: String,
    #[serde(default, skip_serializing)]
    state: ResourceState,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationMetadata {
    create_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    target: String,
    #[serde(default)]
    verb: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResource {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<RpcStatus>,
    #[serde(default)]
    metadata: OperationMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListInstancesResponse {
    #[serde(default)]
    instances: Vec<InstanceResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSharesResponse {
    #[serde(default)]
    shares: Vec<ShareResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListOperationsResponse {
    #[serde(default)]
    operations: Vec<OperationResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: RpcStatus,
}

// =============================================================================
// Conversions
// =============================================================================

impl InstanceResource {
    fn from_domain(instance: &MultishareInstance) -> Self {
        Self {
            tier: instance.tier.clone(),
            networks: vec![NetworkConfig {
                network: instance.network.clone(),
                modes: vec!["MODE_IPV4".to_string()],
                reserved_ip_range: instance.reserved_ip_range.clone(),
                connect_mode: Some(instance.connect_mode.clone()),
                ..Default::default()
            }],
            capacity_gb: instance.capacity_bytes / GIB,
            max_share_count: u64::from(instance.max_share_count),
            multi_share_enabled: true,
            labels: instance.labels.clone(),
            ..Default::default()
        }
    }

    fn into_domain(self) -> Result<MultishareInstance> {
        let key = InstanceKey::parse_uri(&self.name)?;
        let network = self.networks.into_iter().next().unwrap_or_default();
        Ok(MultishareInstance {
            key,
            tier: self.tier,
            network: network.network,
            connect_mode: network.connect_mode.unwrap_or_default(),
            reserved_ip_range: network.reserved_ip_range,
            ip_address: network.ip_addresses.into_iter().next(),
            capacity_bytes: self.capacity_gb * GIB,
            capacity_step_size_gb: self.capacity_step_size_gb,
            max_share_count: u32::try_from(self.max_share_count).unwrap_or(u32::MAX),
            state: self.state,
            labels: self.labels,
        })
    }
}

impl ShareResource {
    fn into_domain(self) -> Result<Share> {
        Ok(Share {
            key: ShareKey::parse_uri(&self.name)?,
            capacity_bytes: self.capacity_gb * GIB,
            state: self.state,
            labels: self.labels,
        })
    }
}

impl OperationResource {
    fn into_domain(self) -> Operation {
        Operation {
            id: self.name,
            target: self.metadata.target,
            verb: self.metadata.verb,
            done: self.done,
            error: self
                .error
                .filter(|e| e.code != 0 || !e.message.is_empty())
                .map(|e| e.message),
            create_time: self.metadata.create_time.unwrap_or_else(Utc::now),
            end_time: self.metadata.end_time,
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Filestore API client
pub struct FilestoreClient {
    http: HttpClient,
    base_url: String,
    access_token: Option<String>,
}

impl FilestoreClient {
    /// Create a client for the configured endpoint
    pub fn new(config: &FilestoreConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let base_url = format!(
            "{}/{}",
            config.endpoint.trim_end_matches('/'),
            config.api_version
        );
        info!("Filestore client targeting {}", base_url);
        Ok(Self {
            http,
            base_url,
            access_token: config.access_token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        debug!("{} {}", method, url);
        let request = self.http.request(method, url);
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        Err(Error::FilestoreApi {
            status: status.as_u16(),
            message,
        })
    }

    /// GET that maps 404 to `None`
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.send(self.request(Method::GET, path)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn operation(&self, request: RequestBuilder) -> Result<Operation> {
        let op: OperationResource = self.send(request).await?;
        Ok(op.into_domain())
    }
}

#[async_trait]
impl FilestoreService for FilestoreClient {
    async fn create_multishare_instance(&self, instance: &MultishareInstance) -> Result<Operation> {
        info!(
            "Creating multishare instance {} ({} bytes)",
            instance.key, instance.capacity_bytes
        );
        let parent = format!(
            "projects/{}/locations/{}/instances",
            instance.key.project, instance.key.location
        );
        let request = self
            .request(Method::POST, &parent)
            .query(&[("instanceId", instance.key.name.as_str())])
            .json(&InstanceResource::from_domain(instance));
        self.operation(request).await
    }

    async fn delete_multishare_instance(&self, key: &InstanceKey) -> Result<Operation> {
        info!("Deleting multishare instance {}", key);
        self.operation(self.request(Method::DELETE, &key.uri())).await
    }

    async fn resize_multishare_instance(
        &self,
        key: &InstanceKey,
        capacity_bytes: u64,
    ) -> Result<Operation> {
        info!("Resizing multishare instance {} to {} bytes", key, capacity_bytes);
        let request = self
            .request(Method::PATCH, &key.uri())
            .query(&[("updateMask", "capacityGb")])
            .json(&serde_json::json!({ "capacityGb": (capacity_bytes / GIB).to_string() }));
        self.operation(request).await
    }

    async fn get_multishare_instance(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<MultishareInstance>> {
        self.get_optional::<InstanceResource>(&key.uri())
            .await?
            .map(InstanceResource::into_domain)
            .transpose()
    }

    async fn list_multishare_instances(
        &self,
        project: &str,
        location: &str,
    ) -> Result<Vec<MultishareInstance>> {
        let path = format!("projects/{}/locations/{}/instances", project, location);
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.request(Method::GET, &path);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: ListInstancesResponse = self.send(request).await?;
            for resource in page.instances {
                if resource.multi_share_enabled {
                    instances.push(resource.into_domain()?);
                }
            }
            page_token = page.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        debug!("Listed {} multishare instances in {}", instances.len(), location);
        Ok(instances)
    }

    async fn create_share(&self, share: &Share) -> Result<Operation> {
        info!("Creating share {} ({} bytes)", share.key, share.capacity_bytes);
        let body = ShareResource {
            capacity_gb: share.capacity_bytes / GIB,
            mount_name: share.key.share.clone(),
            labels: share.labels.clone(),
            ..Default::default()
        };
        let request = self
            .request(Method::POST, &format!("{}/shares", share.key.instance.uri()))
            .query(&[("shareId", share.key.share.as_str())])
            .json(&body);
        self.operation(request).await
    }

    async fn delete_share(&self, key: &ShareKey) -> Result<Operation> {
        info!("Deleting share {}", key);
        self.operation(self.request(Method::DELETE, &key.uri())).await
    }

    async fn resize_share(&self, key: &ShareKey, capacity_bytes: u64) -> Result<Operation> {
        info!("Resizing share {} to {} bytes", key, capacity_bytes);
        let request = self
            .request(Method::PATCH, &key.uri())
            .query(&[("updateMask", "capacityGb")])
            .json(&serde_json::json!({ "capacityGb": (capacity_bytes / GIB).to_string() }));
        self.operation(request).await
    }

    async fn get_share(&self, key: &ShareKey) -> Result<Option<Share>> {
        self.get_optional::<ShareResource>(&key.uri())
            .await?
            .map(ShareResource::into_domain)
            .transpose()
    }

    async fn list_shares(&self, parent: &InstanceKey) -> Result<Vec<Share>> {
        let path = format!("{}/shares", parent.uri());
        let mut shares = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.request(Method::GET, &path);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: ListSharesResponse = self.send(request).await?;
            for resource in page.shares {
                shares.push(resource.into_domain()?);
            }
            page_token = page.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        Ok(shares)
    }

    async fn list_operations(&self, project: &str, location: &str) -> Result<Vec<Operation>> {
        let path = format!("projects/{}/locations/{}/operations", project, location);
        let mut operations = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.request(Method::GET, &path);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: ListOperationsResponse = self.send(request).await?;
            operations.extend(page.operations.into_iter().map(OperationResource::into_domain));
            page_token = page.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        Ok(operations)
    }

    async fn get_operation(&self, name: &str) -> Result<Option<Operation>> {
        Ok(self
            .get_optional::<OperationResource>(name)
            .await?
            .map(OperationResource::into_domain))
    }
}
