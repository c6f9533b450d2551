//! casbin 适配层
//!
//! [`LoaderAdapter`] 把 [`PolicyLoader`] 接到 casbin 的 `Adapter` 接口上。
//! casbin 调用 `load_policy` 时转交给加载器（以及可选的平台策略加载器），
//! 写回类操作转交给加载器的同名方法，因此一律得到 `UnsupportedOperation`。
//! 资源前缀和实际写入的规则不在 casbin 的接口里，经 [`LoadOutcome`] 交回门面。

use std::sync::Arc;

use async_trait::async_trait;
use casbin::error::AdapterError;
use casbin::function_map::{OperatorFunction, key_match2, key_match3};
use casbin::{Adapter, CoreApi, Enforcer, Filter as CasbinFilter, Model};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::definition::{ModelSource, PolicyShape};
use crate::entities::PolicySelector;
use crate::error::{AccessGuardError, Result};
use crate::loaders::{PolicyLoader, insert_rules};
use crate::rule::{Effect, LoadResult, NormalizedRule};

/// 加载器写入规则的目标模型
pub struct PolicyTarget<'a> {
    model: &'a mut dyn Model,
    shape: PolicyShape,
}

impl<'a> PolicyTarget<'a> {
    pub fn new(model: &'a mut dyn Model, shape: PolicyShape) -> Self {
        Self { model, shape }
    }

    pub fn shape(&self) -> PolicyShape {
        self.shape
    }

    /// 写入一条规则，返回是否为新规则
    ///
    /// 字段按模型声明的宽度补齐。模型没有 eft 字段时 deny 规则无法表达，直接跳过。
    pub fn add_rule(&mut self, rule: &NormalizedRule) -> bool {
        let (sec, mut values, width) = match rule {
            NormalizedRule::Permission {
                subject,
                object,
                action,
                effect,
            } => {
                let mut values = vec![subject.clone(), object.clone(), action.clone()];
                if self.shape.has_effect() {
                    values.push(effect.unwrap_or(Effect::Allow).to_string());
                } else if *effect == Some(Effect::Deny) {
                    warn!(line = %rule, "模型没有 eft 字段，跳过 deny 规则");
                    return false;
                }
                ("p", values, self.shape.permission_fields)
            }
            NormalizedRule::Grouping { subject, role } => (
                "g",
                vec![subject.clone(), role.clone()],
                self.shape.grouping_fields,
            ),
        };

        if width == 0 {
            warn!(line = %rule, "模型没有角色定义，跳过分组规则");
            return false;
        }
        values.resize(width, String::new());
        self.model.add_policy(sec, sec, values)
    }

    /// 已写入的权限规则
    pub fn permissions(&self) -> Vec<Vec<String>> {
        self.model.get_policy("p", "p")
    }

    /// 已写入的分组规则
    pub fn groupings(&self) -> Vec<Vec<String>> {
        if self.shape.grouping_fields == 0 {
            return Vec::new();
        }
        self.model.get_policy("g", "g")
    }

    pub fn len(&self) -> usize {
        self.permissions().len() + self.groupings().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 一次加载的结果槽
#[derive(Clone, Default)]
pub(crate) struct LoadOutcome(Arc<Mutex<Option<Result<LoadResult>>>>);

impl LoadOutcome {
    fn record(&self, outcome: Result<LoadResult>) {
        *self.0.lock() = Some(outcome);
    }

    pub(crate) fn take(&self) -> Option<Result<LoadResult>> {
        self.0.lock().take()
    }
}

/// 把加载器包装成 casbin 适配器
///
/// 每次加载都新建一个，选择器在构造时固定。
pub(crate) struct LoaderAdapter {
    loader: Arc<dyn PolicyLoader>,
    /// 主加载之后追加的平台级合成策略
    platform: Option<Arc<dyn PolicyLoader>>,
    source: Arc<ModelSource>,
    selector: PolicySelector,
    outcome: LoadOutcome,
}

impl LoaderAdapter {
    pub(crate) fn new(
        loader: Arc<dyn PolicyLoader>,
        platform: Option<Arc<dyn PolicyLoader>>,
        source: Arc<ModelSource>,
        selector: PolicySelector,
        outcome: LoadOutcome,
    ) -> Self {
        Self {
            loader,
            platform,
            source,
            selector,
            outcome,
        }
    }

    async fn load_into(&self, model: &mut dyn Model) -> Result<LoadResult> {
        let shape = self.source.shape();
        let mut target = PolicyTarget::new(model, shape);
        let mut result = self.loader.load_policy(&mut target, &self.selector).await?;

        if let Some(platform) = &self.platform {
            // 平台策略先写入临时模型，再按已解析的前缀并入
            let mut scratch = self.source.build().await?;
            let extra = platform
                .load_policy(&mut PolicyTarget::new(&mut scratch, shape), &self.selector)
                .await?;
            if result.resource_prefix.is_none() {
                result.resource_prefix = extra.resource_prefix;
            }
            let injected = insert_rules(
                &mut target,
                platform.name(),
                result.resource_prefix.as_deref(),
                extra.policies,
            );
            debug!(rules = injected.len(), "已注入平台策略");
            result.policies.extend(injected);
        }

        Ok(result)
    }

    fn rule_from(ptype: &str, rule: Vec<String>) -> casbin::Result<NormalizedRule> {
        let fields: Vec<String> = std::iter::once(ptype.to_string()).chain(rule).collect();
        NormalizedRule::from_fields(&fields).map_err(|e| bridge_error(&e))
    }
}

fn bridge_error(err: &AccessGuardError) -> casbin::Error {
    casbin::Error::from(AdapterError(err.to_string().into()))
}

#[async_trait]
impl Adapter for LoaderAdapter {
    async fn load_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        let outcome = self.load_into(m).await;
        let bridged = outcome.as_ref().map(|_| ()).map_err(bridge_error);
        self.outcome.record(outcome);
        bridged
    }

    async fn load_filtered_policy<'a>(
        &mut self,
        m: &mut dyn Model,
        f: CasbinFilter<'a>,
    ) -> casbin::Result<()> {
        debug!(
            p_fields = f.p.len(),
            g_fields = f.g.len(),
            selector = %self.selector.describe(),
            "忽略引擎过滤条件，按选择器加载"
        );
        self.load_policy(m).await
    }

    async fn save_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        let rules: Vec<NormalizedRule> = ["p", "g"]
            .into_iter()
            .flat_map(|ptype| {
                m.get_policy(ptype, ptype)
                    .into_iter()
                    .filter_map(move |rule| Self::rule_from(ptype, rule).ok())
            })
            .collect();
        self.loader
            .save_policy(&rules)
            .await
            .map_err(|e| bridge_error(&e))
    }

    async fn clear_policy(&mut self) -> casbin::Result<()> {
        // 模型每次加载都是新建的，没有需要清理的存储
        Ok(())
    }

    fn is_filtered(&self) -> bool {
        self.loader.is_filtered()
    }

    async fn add_policy(
        &mut self,
        _sec: &str,
        ptype: &str,
        rule: Vec<String>,
    ) -> casbin::Result<bool> {
        let rule = Self::rule_from(ptype, rule)?;
        self.loader
            .add_policy(&rule)
            .await
            .map(|_| true)
            .map_err(|e| bridge_error(&e))
    }

    async fn add_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> casbin::Result<bool> {
        for rule in rules {
            self.add_policy(sec, ptype, rule).await?;
        }
        Ok(true)
    }

    async fn remove_policy(
        &mut self,
        _sec: &str,
        ptype: &str,
        rule: Vec<String>,
    ) -> casbin::Result<bool> {
        let rule = Self::rule_from(ptype, rule)?;
        self.loader
            .remove_policy(&rule)
            .await
            .map(|_| true)
            .map_err(|e| bridge_error(&e))
    }

    async fn remove_policies(
        &mut self,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> casbin::Result<bool> {
        for rule in rules {
            self.remove_policy(sec, ptype, rule).await?;
        }
        Ok(true)
    }

    async fn remove_filtered_policy(
        &mut self,
        _sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> casbin::Result<bool> {
        self.loader
            .remove_filtered_policy(ptype, field_index, &field_values)
            .await
            .map(|_| true)
            .map_err(|e| bridge_error(&e))
    }
}

/// 注册模型里用到的路径匹配函数
///
/// `keyMatch2` 支持 `:id` 形式的命名段，`keyMatch3` 支持 `{id}` 形式，二者都支持 `*`。
pub(crate) fn register_path_matchers(engine: &mut Enforcer) {
    engine.add_function(
        "keyMatch2",
        OperatorFunction::Arg2(|path, pattern| {
            key_match2(&path.to_string(), &pattern.to_string()).into()
        }),
    );
    engine.add_function(
        "keyMatch3",
        OperatorFunction::Arg2(|path, pattern| {
            key_match3(&path.to_string(), &pattern.to_string()).into()
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loaders::SyntheticPolicyLoader;

    const NO_EFFECT_MODEL: &str = "[request_definition]\nr = sub, obj, act\n\n\
        [policy_definition]\np = sub, obj, act\n\n\
        [policy_effect]\ne = some(where (p.eft == allow))\n\n\
        [matchers]\nm = r.sub == p.sub && r.obj == p.obj && r.act == p.act\n";

    fn tuple(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    fn adapter(outcome: LoadOutcome) -> LoaderAdapter {
        let loader = SyntheticPolicyLoader::from_fn(|| {
            Ok(vec![
                tuple(&["p", "admin", "/reports/*", "read"]),
                tuple(&["g", "alice", "admin"]),
            ])
        });
        LoaderAdapter::new(
            Arc::new(loader),
            None,
            Arc::new(ModelSource::builtin().unwrap()),
            PolicySelector::All,
            outcome,
        )
    }

    // ==================== 规则写入 ====================

    #[tokio::test]
    async fn test_rules_are_padded_to_model_width() {
        let source = ModelSource::builtin().unwrap();
        let mut model = source.build().await.unwrap();
        let mut target = PolicyTarget::new(&mut model, source.shape());

        assert!(target.add_rule(&NormalizedRule::permission("alice", "/docs", "read", None)));
        assert!(target.add_rule(&NormalizedRule::permission(
            "bob",
            "/docs",
            "read",
            Some(Effect::Deny)
        )));
        assert!(target.add_rule(&NormalizedRule::grouping("alice", "admin")));
        // 重复规则不再写入
        assert!(!target.add_rule(&NormalizedRule::grouping("alice", "admin")));

        assert_eq!(
            target.permissions(),
            vec![
                tuple(&["alice", "/docs", "read", "allow"]),
                tuple(&["bob", "/docs", "read", "deny"]),
            ]
        );
        assert_eq!(target.groupings(), vec![tuple(&["alice", "admin"])]);
        assert_eq!(target.len(), 3);
    }

    #[tokio::test]
    async fn test_model_without_effect_or_roles() {
        let source = ModelSource::from_text(NO_EFFECT_MODEL, "no-effect").unwrap();
        let mut model = source.build().await.unwrap();
        let mut target = PolicyTarget::new(&mut model, source.shape());

        assert!(target.add_rule(&NormalizedRule::permission(
            "alice",
            "/docs",
            "read",
            Some(Effect::Allow)
        )));
        assert!(!target.add_rule(&NormalizedRule::permission(
            "alice",
            "/docs",
            "write",
            Some(Effect::Deny)
        )));
        assert!(!target.add_rule(&NormalizedRule::grouping("alice", "admin")));

        assert_eq!(target.permissions(), vec![tuple(&["alice", "/docs", "read"])]);
        assert!(target.groupings().is_empty());
    }

    // ==================== 适配器 ====================

    #[tokio::test]
    async fn test_adapter_loads_and_records_outcome() {
        let outcome = LoadOutcome::default();
        let mut adapter = adapter(outcome.clone());
        let mut model = ModelSource::builtin().unwrap().build().await.unwrap();

        adapter.load_policy(&mut model).await.unwrap();

        let result = outcome.take().unwrap().unwrap();
        assert_eq!(result.policies.len(), 2);
        assert_eq!(model.get_policy("p", "p").len(), 1);
        assert_eq!(model.get_policy("g", "g").len(), 1);
        assert!(outcome.take().is_none());
    }

    #[tokio::test]
    async fn test_adapter_records_loader_error() {
        let outcome = LoadOutcome::default();
        let loader = SyntheticPolicyLoader::from_fn(|| Err(anyhow::anyhow!("catalog offline")));
        let mut adapter = LoaderAdapter::new(
            Arc::new(loader),
            None,
            Arc::new(ModelSource::builtin().unwrap()),
            PolicySelector::All,
            outcome.clone(),
        );
        let mut model = ModelSource::builtin().unwrap().build().await.unwrap();

        assert!(adapter.load_policy(&mut model).await.is_err());
        let err = outcome.take().unwrap().unwrap_err();
        assert_eq!(err.code(), "GENERATOR_ERROR");
    }

    #[test]
    fn test_adapter_follows_loader_filtered_flag() {
        let adapter = adapter(LoadOutcome::default());
        assert!(!adapter.is_filtered());
        adapter.loader.set_filtered(true);
        assert!(adapter.is_filtered());
    }

    #[tokio::test]
    async fn test_adapter_write_back_is_rejected() {
        let mut adapter = adapter(LoadOutcome::default());
        let mut model = ModelSource::builtin().unwrap().build().await.unwrap();

        let err = adapter
            .add_policy("p", "p", tuple(&["alice", "/docs", "read", "allow"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("add_policy"));
        assert!(adapter.save_policy(&mut model).await.is_err());
        assert!(
            adapter
                .remove_policy("g", "g", tuple(&["alice", "admin"]))
                .await
                .is_err()
        );
        assert!(
            adapter
                .remove_filtered_policy("p", "p", 0, tuple(&["alice"]))
                .await
                .is_err()
        );
        assert!(adapter.clear_policy().await.is_ok());
    }
}
