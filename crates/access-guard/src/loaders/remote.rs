//! 远程策略 API 加载器
//!
//! `GET {base_url}/iam/policies`，响应可以是规则数组，也可以是
//! `{"policies": [...], "resource_prefix": "..."}` 对象。不做重试，由调用方决定。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use super::{PolicyLoader, insert_rules};
use crate::adapter::PolicyTarget;
use crate::entities::PolicySelector;
use crate::error::{AccessGuardError, Result};
use crate::query::{ContextHeaderProvider, RequestHeaderProvider};
use crate::rule::{LoadResult, NormalizedRule};

const POLICIES_PATH: &str = "/iam/policies";

/// 响应中的单条规则
#[derive(Debug, Deserialize)]
struct PolicyEntry {
    ptype: String,
    subject: String,
    object: String,
    action: Option<String>,
    effect: Option<String>,
}

impl PolicyEntry {
    fn to_rule(&self) -> Result<NormalizedRule> {
        NormalizedRule::from_fields(&[
            self.ptype.as_str(),
            self.subject.as_str(),
            self.object.as_str(),
            self.action.as_deref().unwrap_or_default(),
            self.effect.as_deref().unwrap_or_default(),
        ])
    }
}

/// 拆出规则数组和资源前缀；顶层结构不对时整体失败
fn split_body(endpoint: &str, body: Value) -> Result<(Vec<Value>, Option<String>)> {
    match body {
        Value::Array(entries) => Ok((entries, None)),
        Value::Object(mut object) => {
            let entries = match object.remove("policies") {
                Some(Value::Array(entries)) => entries,
                _ => {
                    return Err(AccessGuardError::malformed(
                        endpoint,
                        "expected a `policies` array",
                    ));
                }
            };
            let prefix = match object.remove("resource_prefix") {
                None | Some(Value::Null) => None,
                Some(Value::String(prefix)) => Some(prefix),
                Some(other) => {
                    return Err(AccessGuardError::malformed(
                        endpoint,
                        format!("`resource_prefix` must be a string, got {other}"),
                    ));
                }
            };
            Ok((entries, prefix))
        }
        other => Err(AccessGuardError::malformed(
            endpoint,
            format!("expected an array or object, got {other}"),
        )),
    }
}

/// 远程策略加载器
///
/// 过滤上下文通过请求头传递，具体带哪些头由 [`RequestHeaderProvider`] 决定。
/// 鉴权凭据由网关注入，这里不发送。
pub struct PolicyApiLoader {
    client: reqwest::Client,
    endpoint: String,
    headers: Arc<dyn RequestHeaderProvider>,
    filtered: AtomicBool,
}

impl PolicyApiLoader {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(AccessGuardError::Configuration(
                "policy_api_url must not be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder().build().map_err(|e| {
            AccessGuardError::Configuration(format!("failed to build HTTP client: {e}"))
        })?;

        Ok(Self {
            client,
            endpoint: format!("{base_url}{POLICIES_PATH}"),
            headers: Arc::new(ContextHeaderProvider),
            filtered: AtomicBool::new(false),
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_header_provider(mut self, headers: Arc<dyn RequestHeaderProvider>) -> Self {
        self.headers = headers;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, selector: &PolicySelector) -> Result<Value> {
        let mut request = self.client.get(&self.endpoint).header(ACCEPT, "application/json");
        for (name, value) in self.headers.headers(selector) {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AccessGuardError::unavailable(&self.endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AccessGuardError::unavailable(
                &self.endpoint,
                format!("HTTP {status}"),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AccessGuardError::unavailable(&self.endpoint, e))?;

        serde_json::from_slice(&body).map_err(|e| AccessGuardError::malformed(&self.endpoint, e))
    }
}

#[async_trait]
impl PolicyLoader for PolicyApiLoader {
    fn name(&self) -> &str {
        "remote"
    }

    #[instrument(skip(self, target, selector), fields(endpoint = %self.endpoint, selector = %selector.describe()))]
    async fn load_policy(
        &self,
        target: &mut PolicyTarget<'_>,
        selector: &PolicySelector,
    ) -> Result<LoadResult> {
        let body = self.fetch(selector).await.map_err(|e| {
            error!(error = %e, "拉取远程策略失败");
            e
        })?;
        let (entries, resource_prefix) = split_body(&self.endpoint, body)?;

        let total = entries.len();
        let mut rules = Vec::with_capacity(total);
        for entry in entries {
            let parsed = serde_json::from_value::<PolicyEntry>(entry)
                .map_err(|e| AccessGuardError::malformed(&self.endpoint, e))
                .and_then(|entry| entry.to_rule());
            match parsed {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(error = %e, "跳过无法解析的远程策略条目"),
            }
        }

        let policies = insert_rules(target, self.name(), resource_prefix.as_deref(), rules);
        info!(
            entries = total,
            loaded = policies.len(),
            resource_prefix = resource_prefix.as_deref().unwrap_or_default(),
            "远程策略加载完成"
        );
        Ok(LoadResult::new(resource_prefix, policies))
    }

    fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }

    fn set_filtered(&self, filtered: bool) {
        self.filtered.store(filtered, Ordering::SeqCst);
    }
}
