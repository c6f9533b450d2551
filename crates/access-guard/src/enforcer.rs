//! 鉴权门面
//!
//! 持有模型定义和加载器，负责初始加载、按实体加载、刷新以及对外的判定接口。
//!
//! 每次加载都新建一个 casbin `Enforcer`：解析模型、挂上包装了加载器的适配器、
//! 注册路径匹配函数，再由 casbin 的 `load_policy` 拉取规则并重建角色链接。
//! 完成后通过 `ArcSwap` 整体替换快照。判定只读取当前快照，不会看到加载到一半的
//! 模型；加载之间由互斥锁串行化。

use std::sync::Arc;

use arc_swap::ArcSwap;
use casbin::{CoreApi, Enforcer};
use chrono::{DateTime, Utc};
use crossbeam_utils::atomic::AtomicCell;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use access_guard_shared::config::EnforcerConfig;

use crate::adapter::{LoadOutcome, LoaderAdapter, register_path_matchers};
use crate::definition::ModelSource;
use crate::entities::{Filter, PolicySelector};
use crate::error::{AccessGuardError, Result};
use crate::loaders::{LoaderSources, PolicyLoader, SyntheticPolicyLoader, build_policy_loader};
use crate::rule::LoadResult;

/// 门面状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcerState {
    Uninitialized,
    Loading,
    Ready,
    Refreshing,
}

/// 加载状态报告
#[derive(Debug, Clone, Serialize)]
pub struct LoadStatus {
    pub state: EnforcerState,
    pub loaded: bool,
    pub rule_count: usize,
    pub resource_prefix: Option<String>,
    pub selector: Option<String>,
    pub last_loaded_at: Option<DateTime<Utc>>,
}

/// 一次判定请求的动作列表，任一动作允许即放行
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actions(Vec<String>);

impl Actions {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 错误信息用的逗号分隔形式
    pub fn joined(&self) -> String {
        self.0.join(", ")
    }
}

impl From<&str> for Actions {
    fn from(action: &str) -> Self {
        Self(vec![action.to_string()])
    }
}

impl From<String> for Actions {
    fn from(action: String) -> Self {
        Self(vec![action])
    }
}

impl From<&[&str]> for Actions {
    fn from(actions: &[&str]) -> Self {
        Self(actions.iter().map(|a| a.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Actions {
    fn from(actions: [&str; N]) -> Self {
        Self(actions.iter().map(|a| a.to_string()).collect())
    }
}

impl From<&[String]> for Actions {
    fn from(actions: &[String]) -> Self {
        Self(actions.to_vec())
    }
}

impl From<Vec<String>> for Actions {
    fn from(actions: Vec<String>) -> Self {
        Self(actions)
    }
}

impl From<Vec<&str>> for Actions {
    fn from(actions: Vec<&str>) -> Self {
        actions.as_slice().into()
    }
}

/// 一次完整加载的产物
struct Snapshot {
    /// 尚未加载时为 None，此时一律拒绝
    engine: Option<Enforcer>,
    resource_prefix: Option<String>,
    /// 产生该快照的选择器；延迟加载且尚未加载时为 None
    selector: Option<PolicySelector>,
    loaded_at: Option<DateTime<Utc>>,
    lines: Vec<String>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            engine: None,
            resource_prefix: None,
            selector: None,
            loaded_at: None,
            lines: Vec::new(),
        }
    }

    /// 引擎报错按拒绝处理
    fn enforce(&self, user: &str, resource: &str, action: &str) -> bool {
        let Some(engine) = &self.engine else {
            return false;
        };
        match engine.enforce((user, resource, action)) {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(user, resource, action, error = %e, "判定出错，按拒绝处理");
                false
            }
        }
    }

    /// 直接拼接前缀，不插入分隔符
    fn qualify(&self, resource: &str) -> String {
        match &self.resource_prefix {
            Some(prefix) => format!("{prefix}{resource}"),
            None => resource.to_string(),
        }
    }
}

/// 鉴权门面
pub struct PermissionsEnforcer {
    loader: Arc<dyn PolicyLoader>,
    /// 主加载之后追加的平台级合成策略
    platform: Option<Arc<dyn PolicyLoader>>,
    model: Arc<ModelSource>,
    initial_selector: PolicySelector,
    snapshot: ArcSwap<Snapshot>,
    state: AtomicCell<EnforcerState>,
    load_lock: Mutex<()>,
}

impl PermissionsEnforcer {
    /// 按配置构造加载器并完成初始加载（除非配置了延迟加载）
    pub async fn new(config: &EnforcerConfig, sources: &LoaderSources) -> Result<Self> {
        let loader = build_policy_loader(config, sources)?;

        let platform = if config.inject_platform_policies {
            let generator = sources.generator.clone().ok_or_else(|| {
                AccessGuardError::Configuration(
                    "policy generator must be provided when inject_platform_policies is enabled"
                        .to_string(),
                )
            })?;
            Some(Arc::new(SyntheticPolicyLoader::new(generator)) as Arc<dyn PolicyLoader>)
        } else {
            None
        };

        Self::with_loader(config, loader, platform).await
    }

    /// 使用现成的加载器构造
    ///
    /// 只读取配置里的模型路径、过滤条件和延迟加载开关。
    pub async fn with_loader(
        config: &EnforcerConfig,
        loader: Arc<dyn PolicyLoader>,
        platform: Option<Arc<dyn PolicyLoader>>,
    ) -> Result<Self> {
        let model = ModelSource::resolve(config.rbac_model_path.as_deref()).await?;
        info!(model = model.origin(), loader = loader.name(), "初始化鉴权门面");
        // 模型文本有误时在构造阶段失败，而不是等到第一次加载
        model.build().await?;

        // 加载时机只由门面决定；casbin 看到过滤标记后不会在构造时自行全量加载
        loader.set_filtered(true);
        if let Some(platform) = &platform {
            platform.set_filtered(true);
        }

        let initial_selector =
            PolicySelector::from_filter(config.filter.clone().map(Filter::from));

        let enforcer = Self {
            loader,
            platform,
            model: Arc::new(model),
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
            initial_selector,
            state: AtomicCell::new(EnforcerState::Uninitialized),
            load_lock: Mutex::new(()),
        };

        if config.defer_initial_load {
            info!("已配置延迟加载，跳过初始策略加载");
            enforcer.state.store(EnforcerState::Ready);
        } else {
            let selector = enforcer.initial_selector.clone();
            enforcer.run_load(Some(selector)).await?;
        }

        Ok(enforcer)
    }

    pub fn state(&self) -> EnforcerState {
        self.state.load()
    }

    /// 当前生效的资源前缀
    pub fn resource_prefix(&self) -> Option<String> {
        self.snapshot.load().resource_prefix.clone()
    }

    /// 是否允许 `user` 对 `resource` 执行任一动作
    ///
    /// 资源会先拼上已解析的前缀。未知用户、资源或动作一律拒绝。
    pub fn has_permission(&self, user: &str, resource: &str, actions: impl Into<Actions>) -> bool {
        let actions = actions.into();
        let snapshot = self.snapshot.load();
        let qualified = snapshot.qualify(resource);

        let allowed = actions
            .iter()
            .any(|action| snapshot.enforce(user, &qualified, action));

        metrics::counter!(
            "access_guard_decisions_total",
            "outcome" => if allowed { "allow" } else { "deny" }
        )
        .increment(1);
        debug!(
            user,
            resource = %qualified,
            actions = %actions.joined(),
            allowed,
            "权限判定"
        );
        allowed
    }

    /// 无权限时返回 `PermissionDenied`
    pub fn require_permission(
        &self,
        user: &str,
        resource: &str,
        actions: impl Into<Actions>,
    ) -> Result<()> {
        let actions = actions.into();
        if self.has_permission(user, resource, actions.clone()) {
            return Ok(());
        }

        Err(AccessGuardError::PermissionDenied {
            user: user.to_string(),
            resource: resource.to_string(),
            actions: actions.joined(),
        })
    }

    /// 对已限定的资源做单动作判定，不拼接前缀
    pub fn enforce(&self, user: &str, qualified_resource: &str, action: &str) -> bool {
        self.snapshot.load().enforce(user, qualified_resource, action)
    }

    /// 按选择器重新加载，替换当前全部规则
    ///
    /// 延迟加载的门面通过它加载某个用户或角色的规则。
    #[instrument(skip(self, selector), fields(selector = %selector.describe()))]
    pub async fn load_policy(&self, selector: PolicySelector) -> Result<LoadResult> {
        self.run_load(Some(selector)).await
    }

    /// 全量刷新
    ///
    /// 重跑最近一次生效的选择器；从未加载过时使用配置的初始选择器。
    /// 失败时保留上一次成功加载的结果。
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<()> {
        self.run_load(None).await.map(|_| ())
    }

    pub fn load_status(&self) -> LoadStatus {
        let snapshot = self.snapshot.load();
        LoadStatus {
            state: self.state.load(),
            loaded: snapshot.loaded_at.is_some(),
            rule_count: snapshot.lines.len(),
            resource_prefix: snapshot.resource_prefix.clone(),
            selector: snapshot.selector.as_ref().map(PolicySelector::describe),
            last_loaded_at: snapshot.loaded_at,
        }
    }

    /// 当前生效规则的策略行
    pub fn policy_lines(&self) -> Vec<String> {
        self.snapshot.load().lines.clone()
    }

    /// 加载器当前的过滤标记
    pub fn is_filtered(&self) -> bool {
        self.loader.is_filtered()
    }

    async fn run_load(&self, selector: Option<PolicySelector>) -> Result<LoadResult> {
        let _guard = self.load_lock.lock().await;

        let selector = selector.unwrap_or_else(|| {
            self.snapshot
                .load()
                .selector
                .clone()
                .unwrap_or_else(|| self.initial_selector.clone())
        });

        let previous = self.state.load();
        let transient = match previous {
            EnforcerState::Ready | EnforcerState::Refreshing => EnforcerState::Refreshing,
            EnforcerState::Uninitialized | EnforcerState::Loading => EnforcerState::Loading,
        };
        self.state.store(transient);

        match self.build_snapshot(selector).await {
            Ok((snapshot, result)) => {
                info!(
                    rules = snapshot.lines.len(),
                    resource_prefix = snapshot.resource_prefix.as_deref().unwrap_or_default(),
                    selector = ?snapshot.selector,
                    "策略加载完成"
                );
                self.snapshot.store(Arc::new(snapshot));
                self.state.store(EnforcerState::Ready);
                metrics::counter!("access_guard_policy_loads_total", "status" => "success")
                    .increment(1);
                Ok(result)
            }
            Err(e) => {
                self.state.store(previous);
                metrics::counter!("access_guard_policy_loads_total", "status" => "failure")
                    .increment(1);
                if previous == EnforcerState::Ready {
                    warn!(error = %e, "策略刷新失败，保留上一次加载结果");
                } else {
                    error!(error = %e, "策略加载失败");
                }
                Err(e)
            }
        }
    }

    async fn build_snapshot(&self, selector: PolicySelector) -> Result<(Snapshot, LoadResult)> {
        let outcome = LoadOutcome::default();
        let adapter = LoaderAdapter::new(
            self.loader.clone(),
            self.platform.clone(),
            self.model.clone(),
            selector.clone(),
            outcome.clone(),
        );

        // 加载器的原始错误优先于 casbin 包装后的错误
        let mut engine = match Enforcer::new(self.model.build().await?, adapter).await {
            Ok(engine) => engine,
            Err(e) => {
                let original = outcome.take().and_then(|loaded| loaded.err());
                return Err(original.unwrap_or_else(|| e.into()));
            }
        };
        register_path_matchers(&mut engine);
        let loaded = engine.load_policy().await;

        let result = match (outcome.take(), loaded) {
            (Some(Err(e)), _) => return Err(e),
            (_, Err(e)) => return Err(e.into()),
            (Some(Ok(result)), Ok(())) => result,
            (None, Ok(())) => {
                return Err(AccessGuardError::Engine(
                    "policy adapter was not invoked".to_string(),
                ));
            }
        };

        let snapshot = Snapshot {
            engine: Some(engine),
            resource_prefix: result.resource_prefix.clone(),
            selector: Some(selector),
            loaded_at: Some(Utc::now()),
            lines: result.policy_lines(),
        };
        Ok((snapshot, result))
    }
}

impl std::fmt::Debug for PermissionsEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionsEnforcer")
            .field("loader", &self.loader.name())
            .field("state", &self.state.load())
            .field("resource_prefix", &self.resource_prefix())
            .finish()
    }
}
