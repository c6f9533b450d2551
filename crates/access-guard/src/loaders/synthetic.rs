//! 合成策略加载器
//!
//! 调用进程内生成器得到字面量规则元组，常用于注入平台级隐含策略。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{PolicyLoader, insert_rules};
use crate::adapter::PolicyTarget;
use crate::entities::PolicySelector;
use crate::error::Result;
use crate::rule::{LoadResult, NormalizedRule};

/// 无参生成器，返回 `[ptype, subject, object, action?, effect?]` 元组
pub type PolicyGenerator = Arc<dyn Fn() -> anyhow::Result<Vec<Vec<String>>> + Send + Sync>;

pub struct SyntheticPolicyLoader {
    generator: PolicyGenerator,
    filtered: AtomicBool,
}

impl SyntheticPolicyLoader {
    pub fn new(generator: PolicyGenerator) -> Self {
        Self {
            generator,
            filtered: AtomicBool::new(false),
        }
    }

    pub fn from_fn<F>(generator: F) -> Self
    where
        F: Fn() -> anyhow::Result<Vec<Vec<String>>> + Send + Sync + 'static,
    {
        Self::new(Arc::new(generator))
    }
}

#[async_trait]
impl PolicyLoader for SyntheticPolicyLoader {
    fn name(&self) -> &str {
        "synthetic"
    }

    /// 选择器对生成器无意义，忽略
    async fn load_policy(
        &self,
        target: &mut PolicyTarget<'_>,
        _selector: &PolicySelector,
    ) -> Result<LoadResult> {
        // 生成器错误原样透传
        let tuples = (self.generator)()?;

        let total = tuples.len();
        let rules: Vec<NormalizedRule> = tuples
            .iter()
            .filter_map(|fields| match NormalizedRule::from_fields(fields.as_slice()) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(fields = ?fields, error = %e, "跳过无效的合成策略");
                    None
                }
            })
            .collect();

        let policies = insert_rules(target, self.name(), None, rules);
        info!(tuples = total, loaded = policies.len(), "合成策略加载完成");
        Ok(LoadResult::policies(policies))
    }

    fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }

    fn set_filtered(&self, filtered: bool) {
        self.filtered.store(filtered, Ordering::SeqCst);
    }
}
