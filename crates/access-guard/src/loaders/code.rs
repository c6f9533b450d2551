//! 代码策略加载器
//!
//! 策略来自实现了 [`PolicyProvider`] 的类型化对象。记录在构造时校验，
//! 加载阶段不会再出现格式错误。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use super::{PolicyLoader, insert_rules};
use crate::adapter::PolicyTarget;
use crate::entities::{Filter, PolicySelector};
use crate::error::Result;
use crate::rule::{LoadResult, NormalizedRule};

/// 类型化策略记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PolicyRecord {
    #[validate(length(min = 1, max = 1, message = "ptype 必须是 p 或 g"))]
    ptype: String,
    #[validate(length(min = 1, max = 255, message = "subject 不能为空且不超过255字符"))]
    sub: String,
    #[validate(length(min = 1, max = 1024, message = "object 不能为空且不超过1024字符"))]
    obj: Option<String>,
    #[validate(length(min = 1, max = 64, message = "action 不能为空且不超过64字符"))]
    act: Option<String>,
    effect: Option<String>,
}

impl PolicyRecord {
    /// 校验并构造记录，字段约束与规则结构都在这里检查
    pub fn try_new(
        ptype: impl Into<String>,
        sub: impl Into<String>,
        obj: Option<&str>,
        act: Option<&str>,
        effect: Option<&str>,
    ) -> Result<Self> {
        let record = Self {
            ptype: ptype.into(),
            sub: sub.into(),
            obj: obj.map(str::to_string),
            act: act.map(str::to_string),
            effect: effect.map(str::to_string),
        };
        record.to_rule()?;
        Ok(record)
    }

    pub fn permission(sub: &str, obj: &str, act: &str) -> Result<Self> {
        Self::try_new("p", sub, Some(obj), Some(act), None)
    }

    pub fn grouping(sub: &str, role: &str) -> Result<Self> {
        Self::try_new("g", sub, Some(role), None, None)
    }

    fn to_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = [
            Some(self.ptype.as_str()),
            Some(self.sub.as_str()),
            self.obj.as_deref(),
            self.act.as_deref(),
            self.effect.as_deref(),
        ]
        .into_iter()
        .map(Option::unwrap_or_default)
        .collect();

        while fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }
        fields
    }

    /// 反序列化得到的记录没有经过 `try_new`，这里再校验一次
    pub fn to_rule(&self) -> Result<NormalizedRule> {
        self.validate()?;
        NormalizedRule::from_fields(self.to_fields().as_slice())
    }
}

/// 类型化策略提供者
pub trait PolicyProvider: Send + Sync {
    fn policies(&self, filter: Option<&Filter>) -> Result<Vec<PolicyRecord>>;
}

/// 内存中的固定策略集，可整体替换
#[derive(Debug, Default)]
pub struct StaticPolicyProvider {
    records: RwLock<Vec<PolicyRecord>>,
}

impl StaticPolicyProvider {
    pub fn new(records: Vec<PolicyRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn replace(&self, records: Vec<PolicyRecord>) {
        *self.records.write() = records;
    }
}

impl PolicyProvider for StaticPolicyProvider {
    fn policies(&self, _filter: Option<&Filter>) -> Result<Vec<PolicyRecord>> {
        Ok(self.records.read().clone())
    }
}

pub struct PolicyCodeLoader {
    provider: Arc<dyn PolicyProvider>,
    filtered: AtomicBool,
}

impl PolicyCodeLoader {
    pub fn new(provider: Arc<dyn PolicyProvider>) -> Self {
        Self {
            provider,
            filtered: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PolicyLoader for PolicyCodeLoader {
    fn name(&self) -> &str {
        "code"
    }

    async fn load_policy(
        &self,
        target: &mut PolicyTarget<'_>,
        selector: &PolicySelector,
    ) -> Result<LoadResult> {
        let records = self.provider.policies(selector.filter())?;
        let rules = records
            .iter()
            .map(PolicyRecord::to_rule)
            .collect::<Result<Vec<_>>>()?;

        let policies = insert_rules(target, self.name(), None, rules);
        info!(loaded = policies.len(), "代码策略加载完成");
        Ok(LoadResult::policies(policies))
    }

    fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }

    fn set_filtered(&self, filtered: bool) {
        self.filtered.store(filtered, Ordering::SeqCst);
    }
}
