//! 策略加载器
//!
//! 每个加载器把自己策略源里的规则写进 casbin 模型，并单独返回资源前缀等元数据。
//! 加载时机完全由门面决定，加载器本身从不主动全量拉取，也不改写过滤标记。

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

use access_guard_shared::config::{EnforcerConfig, PolicyLoaderType};

use crate::entities::PolicySelector;
use crate::error::{AccessGuardError, Result};
use crate::adapter::PolicyTarget;
use crate::query::{IamPolicyQueryProvider, PolicyQueryProvider, RequestHeaderProvider};
use crate::rule::{LoadResult, NormalizedRule};

pub mod code;
pub mod db;
pub mod multi;
pub mod remote;
pub mod synthetic;

pub use code::{PolicyCodeLoader, PolicyProvider, PolicyRecord, StaticPolicyProvider};
pub use db::{PgRowSource, PolicyDbLoader, PolicyRow, PolicyRowSource};
pub use multi::MultiLoader;
pub use remote::PolicyApiLoader;
pub use synthetic::{PolicyGenerator, SyntheticPolicyLoader};

/// 策略加载器接口
///
/// 写回类操作对应 casbin `Adapter` 的持久化接口，所有实现都返回
/// `UnsupportedOperation`，策略变更归上游管理服务负责。
///
/// 过滤标记归门面所有：门面构造时置位，casbin 据此跳过构造期的全量加载。
/// 加载器只保存它，不在加载过程中改写。
#[async_trait]
pub trait PolicyLoader: Send + Sync {
    /// 日志和错误里使用的加载器名称
    fn name(&self) -> &str;

    /// 按选择器加载规则并写入模型
    async fn load_policy(
        &self,
        target: &mut PolicyTarget<'_>,
        selector: &PolicySelector,
    ) -> Result<LoadResult>;

    fn is_filtered(&self) -> bool;

    fn set_filtered(&self, filtered: bool);

    async fn save_policy(&self, _rules: &[NormalizedRule]) -> Result<()> {
        Err(unsupported(self.name(), "save_policy"))
    }

    async fn add_policy(&self, _rule: &NormalizedRule) -> Result<()> {
        Err(unsupported(self.name(), "add_policy"))
    }

    async fn remove_policy(&self, _rule: &NormalizedRule) -> Result<()> {
        Err(unsupported(self.name(), "remove_policy"))
    }

    async fn remove_filtered_policy(
        &self,
        _ptype: &str,
        _field_index: usize,
        _field_values: &[String],
    ) -> Result<()> {
        Err(unsupported(self.name(), "remove_filtered_policy"))
    }
}

fn unsupported(loader: &str, operation: &'static str) -> AccessGuardError {
    AccessGuardError::UnsupportedOperation {
        loader: loader.to_string(),
        operation,
    }
}

/// 把一批规则写入模型
///
/// 策略源声明了资源前缀时，权限规则的 object 统一补上该前缀（已带前缀的不重复补），
/// 这样门面对查询资源做一次限定即可命中。返回新写入的规则，重复的不计。
pub(crate) fn insert_rules(
    target: &mut PolicyTarget<'_>,
    origin: &str,
    resource_prefix: Option<&str>,
    rules: Vec<NormalizedRule>,
) -> Vec<NormalizedRule> {
    let prefix = resource_prefix.filter(|p| !p.is_empty());

    rules
        .into_iter()
        .filter_map(|rule| {
            let rule = match (rule, prefix) {
                (
                    NormalizedRule::Permission {
                        subject,
                        object,
                        action,
                        effect,
                    },
                    Some(prefix),
                ) if !object.starts_with(prefix) => NormalizedRule::Permission {
                    subject,
                    object: format!("{prefix}{object}"),
                    action,
                    effect,
                },
                (rule, _) => rule,
            };
            if !target.add_rule(&rule) {
                debug!(loader = origin, line = %rule, "跳过重复或无法写入的规则");
                return None;
            }
            debug!(loader = origin, line = %rule, "加载策略规则");
            Some(rule)
        })
        .collect()
}

/// 构造加载器所需的外部协作者
///
/// 哪些字段必填取决于配置的加载器类型。
#[derive(Clone, Default)]
pub struct LoaderSources {
    pub pool: Option<PgPool>,
    /// 优先于 `pool`，便于替换行数据来源
    pub row_source: Option<Arc<dyn PolicyRowSource>>,
    pub query_provider: Option<Arc<dyn PolicyQueryProvider>>,
    pub header_provider: Option<Arc<dyn RequestHeaderProvider>>,
    pub generator: Option<PolicyGenerator>,
    pub provider: Option<Arc<dyn PolicyProvider>>,
}

impl LoaderSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_row_source(mut self, row_source: Arc<dyn PolicyRowSource>) -> Self {
        self.row_source = Some(row_source);
        self
    }

    pub fn with_query_provider(mut self, provider: Arc<dyn PolicyQueryProvider>) -> Self {
        self.query_provider = Some(provider);
        self
    }

    pub fn with_header_provider(mut self, provider: Arc<dyn RequestHeaderProvider>) -> Self {
        self.header_provider = Some(provider);
        self
    }

    pub fn with_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> anyhow::Result<Vec<Vec<String>>> + Send + Sync + 'static,
    {
        self.generator = Some(Arc::new(generator));
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn PolicyProvider>) -> Self {
        self.provider = Some(provider);
        self
    }
}

/// 按配置构造加载器
///
/// 只配置一种类型时直接返回该加载器，多种类型按配置顺序组合为 [`MultiLoader`]。
pub fn build_policy_loader(
    config: &EnforcerConfig,
    sources: &LoaderSources,
) -> Result<Arc<dyn PolicyLoader>> {
    config.validate().map_err(AccessGuardError::Configuration)?;

    let mut loaders = config
        .policy_loader_types
        .iter()
        .map(|loader_type| build_single(*loader_type, config, sources))
        .collect::<Result<Vec<_>>>()?;

    info!(
        loader_types = ?config.policy_loader_types,
        "策略加载器已创建"
    );

    if loaders.len() == 1 {
        if let Some(loader) = loaders.pop() {
            return Ok(loader);
        }
    }
    Ok(Arc::new(MultiLoader::new(loaders)))
}

fn build_single(
    loader_type: PolicyLoaderType,
    config: &EnforcerConfig,
    sources: &LoaderSources,
) -> Result<Arc<dyn PolicyLoader>> {
    let missing = |what: &str| {
        AccessGuardError::Configuration(format!(
            "{what} must be provided for loader type {}",
            loader_type.as_str()
        ))
    };

    let loader: Arc<dyn PolicyLoader> = match loader_type {
        PolicyLoaderType::Db => {
            let row_source = match (&sources.row_source, &sources.pool) {
                (Some(row_source), _) => row_source.clone(),
                (None, Some(pool)) => Arc::new(PgRowSource::new(pool.clone())),
                (None, None) => return Err(missing("database pool")),
            };
            let query_provider = sources
                .query_provider
                .clone()
                .unwrap_or_else(|| Arc::new(IamPolicyQueryProvider));
            Arc::new(PolicyDbLoader::new(row_source, query_provider))
        }
        PolicyLoaderType::Remote => {
            let base_url = config
                .policy_api_url
                .as_deref()
                .ok_or_else(|| missing("policy_api_url"))?;
            let mut loader = PolicyApiLoader::new(base_url)?;
            if let Some(headers) = &sources.header_provider {
                loader = loader.with_header_provider(headers.clone());
            }
            Arc::new(loader)
        }
        PolicyLoaderType::Synthetic => {
            let generator = sources
                .generator
                .clone()
                .ok_or_else(|| missing("policy generator"))?;
            Arc::new(SyntheticPolicyLoader::new(generator))
        }
        PolicyLoaderType::Code => {
            let provider = sources
                .provider
                .clone()
                .ok_or_else(|| missing("policy provider"))?;
            Arc::new(PolicyCodeLoader::new(provider))
        }
    };

    Ok(loader)
}

#[cfg(test)]
pub(crate) mod test_support {
    use casbin::DefaultModel;

    use crate::definition::{ModelSource, PolicyShape};

    pub(crate) async fn builtin_model() -> DefaultModel {
        ModelSource::builtin().unwrap().build().await.unwrap()
    }

    pub(crate) fn builtin_shape() -> PolicyShape {
        ModelSource::builtin().unwrap().shape()
    }
}
