//! HTTP/JSON v1 driver.
//!
//! Wire contract with the farm runtime:
//! - `GET {api}/{kind}` -> JSON array of records (`id`, `parentId?`, `pk`,
//!   `version`, `_entity_type`, `_etag`)
//! - `GET {api}/{kind}/{id}` -> array filtered by id
//! - `POST {api}/{kind}` / `PUT {api}/{kind}/{id}` with the entity body
//! - `DELETE {api}/{kind}[/{id}]` with a `{"id": .., "version": ..}` body

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use lbfarm_core::diff::{self, DiffAction, RemoteRecord};
use lbfarm_core::{compound_key, EntityKind, RemoteIndex};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{Driver, DriverProps, FarmStatus};

pub struct HttpJsonDriver {
    client: reqwest::Client,
}

impl HttpJsonDriver {
    pub const DRIVER_NAME: &'static str = "httpjson";

    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build farm HTTP client");
        Self { client }
    }

    /// Farm `api` fields may be bare host:port.
    fn normalize_api(api: &str) -> String {
        if api.starts_with("http") {
            api.to_string()
        } else {
            format!("http://{}", api)
        }
    }

    fn id_of(json: &Value) -> String {
        json.get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn log_exchange(ok: bool, method: &str, url: &str, request: &Value, status: u16, response: &str) {
        if ok {
            info!("{} {} -> {}", method, url, status);
            info!("request: {}", request);
            info!("response: {}", response);
        } else {
            error!("{} {} -> {}", method, url, status);
            error!("request: {}", request);
            error!("response: {}", response);
        }
    }

    /// Submit a body-carrying request and map the response to a bool.
    /// Transport errors never escape; they are logged and read as false.
    async fn submit(&self, method: reqwest::Method, url: &str, body: &Value) -> bool {
        let request = self
            .client
            .request(method.clone(), url)
            .json(body)
            .send()
            .await;
        match request {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                let ok = status < 400;
                Self::log_exchange(ok, method.as_str(), url, body, status, &text);
                ok
            }
            Err(e) => {
                error!("{} {} ({})", method, url, e);
                false
            }
        }
    }

    /// GET a JSON document; None on any transport, status or parse error.
    async fn get_json(&self, url: &str) -> Option<Value> {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status >= 400 {
                    debug!("GET {} -> {}", url, status);
                    return None;
                }
                match response.json::<Value>().await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        error!("GET {} unparsable body ({})", url, e);
                        None
                    }
                }
            }
            Err(e) => {
                error!("GET {} ({})", url, e);
                None
            }
        }
    }

    /// Field that may arrive as a JSON string or number.
    fn field_string(element: &Value, field: &str) -> String {
        match element.get(field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }

    /// True when a record for `name` (scoped to `parent` if given) carries
    /// the expected version.
    async fn is_synchronized(
        &self,
        full_path: &str,
        name: &str,
        parent: Option<&str>,
        expected_version: i64,
    ) -> bool {
        let Some(json) = self.get_json(full_path).await else {
            return false;
        };
        let mut remote_version: i64 = -1;
        if let Some(elements) = json.as_array() {
            for element in elements {
                if element.get("id").and_then(Value::as_str) != Some(name) {
                    continue;
                }
                let parent_matches = match parent {
                    None => true,
                    Some(p) => element.get("parentId").and_then(Value::as_str) == Some(p),
                };
                if parent_matches {
                    remote_version = element.get("version").and_then(Value::as_i64).unwrap_or(-1);
                } else {
                    debug!(
                        "CHECK FAIL {} : parent={:?} expected_version={}",
                        full_path, parent, expected_version
                    );
                }
            }
        }
        let synchronized = expected_version == remote_version;
        if !synchronized {
            error!(
                "{} : VERSION NOT MATCH (manager:{} != farm:{})",
                full_path, expected_version, remote_version
            );
        }
        synchronized
    }

    async fn count_matches(&self, base_path: &str, expected: u64) -> bool {
        let Some(json) = self.get_json(base_path).await else {
            return false;
        };
        let count = json.as_array().map(Vec::len).unwrap_or(0) as u64;
        let matches = count == expected;
        if !matches {
            error!(
                "{} : COUNT NOT MATCH (manager:{} != farm:{})",
                base_path, expected, count
            );
        }
        matches
    }
}

#[async_trait]
impl Driver for HttpJsonDriver {
    fn name(&self) -> &'static str {
        Self::DRIVER_NAME
    }

    async fn exist(&self, props: &DriverProps) -> bool {
        let api = Self::normalize_api(&props.api);
        let id = Self::id_of(&props.json);
        let url = format!("{}/{}/{}", api, props.path, urlencoding::encode(&id));

        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                let ok = status < 400;
                Self::log_exchange(ok, "GET", &url, &props.json, status, &text);
                if !ok {
                    return false;
                }
                // Parent-scoped existence: the listing must carry an
                // element under the requested parent.
                if let Some(parent) = props.json.get("parentId").and_then(Value::as_str) {
                    let Ok(listing) = serde_json::from_str::<Value>(&text) else {
                        return false;
                    };
                    return listing
                        .as_array()
                        .map(|elements| {
                            elements.iter().any(|element| {
                                element.get("parentId").and_then(Value::as_str) == Some(parent)
                            })
                        })
                        .unwrap_or(false);
                }
                true
            }
            Err(e) => {
                error!("GET {} ({})", url, e);
                false
            }
        }
    }

    async fn create(&self, props: &DriverProps) -> bool {
        let api = Self::normalize_api(&props.api);
        let url = format!("{}/{}", api, props.path);
        self.submit(reqwest::Method::POST, &url, &props.json).await
    }

    async fn update(&self, props: &DriverProps) -> bool {
        let api = Self::normalize_api(&props.api);
        let id = Self::id_of(&props.json);
        let url = format!("{}/{}/{}", api, props.path, urlencoding::encode(&id));
        self.submit(reqwest::Method::PUT, &url, &props.json).await
    }

    async fn remove(&self, props: &DriverProps) -> bool {
        let api = Self::normalize_api(&props.api);
        let id = Self::id_of(&props.json);
        // No id means collection wipe: the empty-id sentinel body.
        let (url, body) = if id.is_empty() {
            (
                format!("{}/{}", api, props.path),
                json!({"id": "", "version": 0}),
            )
        } else {
            (
                format!("{}/{}/{}", api, props.path, urlencoding::encode(&id)),
                props.json.clone(),
            )
        };
        self.submit(reqwest::Method::DELETE, &url, &body).await
    }

    async fn status(&self, props: &DriverProps) -> FarmStatus {
        let api = Self::normalize_api(&props.api);
        let base_path = format!("{}/{}", api, props.path);
        let name = props.name.as_deref().unwrap_or("UNDEF");
        let expected_version = props.expected_version.unwrap_or(-1);
        let Some(num_elements) = props.num_elements else {
            warn!("STATUS FAIL: {} (no expected element count)", base_path);
            return FarmStatus::Fail;
        };

        if !self.count_matches(&base_path, num_elements).await {
            return FarmStatus::Fail;
        }

        let full_path = format!("{}/{}", base_path, urlencoding::encode(name));
        let mut result = true;
        if props.parents.is_empty() {
            result = self
                .is_synchronized(&full_path, name, None, expected_version)
                .await;
        } else {
            for parent in &props.parents {
                if !result {
                    break;
                }
                result = self
                    .is_synchronized(&full_path, name, Some(parent), expected_version)
                    .await;
            }
        }

        if result {
            debug!("STATUS OK: {}", full_path);
            FarmStatus::Ok
        } else {
            warn!("STATUS FAIL: {}", full_path);
            FarmStatus::Fail
        }
    }

    async fn get_all(&self, props: &DriverProps) -> RemoteIndex {
        let api = Self::normalize_api(&props.api);
        let mut index = RemoteIndex::new();

        for kind in EntityKind::ALL {
            let url = format!("{}/{}", api, kind.as_path());
            let Some(json) = self.get_json(&url).await else {
                continue;
            };
            let Some(elements) = json.as_array() else {
                warn!("GET {} did not return an array", url);
                continue;
            };
            let records = index.entry(kind).or_default();
            for element in elements {
                let Some(id) = element.get("id").and_then(Value::as_str) else {
                    warn!("GET {} element without id skipped", url);
                    continue;
                };
                let parent_id = element
                    .get("parentId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let record = RemoteRecord {
                    id: id.to_string(),
                    parent_id: parent_id.clone(),
                    pk: Self::field_string(element, "pk"),
                    version: Self::field_string(element, "version"),
                    entity_type: Self::field_string(element, "_entity_type"),
                    etag: Self::field_string(element, "_etag"),
                };
                records.insert(compound_key(id, &parent_id), record);
            }
        }
        index
    }

    async fn diff(
        &self,
        props: &DriverProps,
        remote: &RemoteIndex,
    ) -> BTreeMap<String, DiffAction> {
        let api = Self::normalize_api(&props.api);
        diff::compute(&api, &props.declared, remote)
    }
}
