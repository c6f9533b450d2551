//! 多源聚合加载器

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::PolicyLoader;
use crate::adapter::PolicyTarget;
use crate::entities::PolicySelector;
use crate::error::Result;
use crate::rule::LoadResult;

/// 按注册顺序依次调用成员加载器，所有规则写入同一个模型
///
/// 第一个返回非空资源前缀的成员决定聚合前缀，之后的前缀被忽略。
/// 任一成员失败则整次加载失败。
pub struct MultiLoader {
    loaders: Vec<Arc<dyn PolicyLoader>>,
}

impl MultiLoader {
    pub fn new(loaders: Vec<Arc<dyn PolicyLoader>>) -> Self {
        Self { loaders }
    }

    pub fn loaders(&self) -> &[Arc<dyn PolicyLoader>] {
        &self.loaders
    }
}

#[async_trait]
impl PolicyLoader for MultiLoader {
    fn name(&self) -> &str {
        "multi"
    }

    #[instrument(skip(self, target), fields(members = self.loaders.len()))]
    async fn load_policy(
        &self,
        target: &mut PolicyTarget<'_>,
        selector: &PolicySelector,
    ) -> Result<LoadResult> {
        let mut resource_prefix: Option<String> = None;
        let mut policies = Vec::new();

        for loader in &self.loaders {
            let result = loader.load_policy(target, selector).await?;

            // TODO: 支持每个策略源各自的前缀列表，而不是只取第一个
            if let Some(prefix) = result.resource_prefix {
                match &resource_prefix {
                    None => resource_prefix = Some(prefix),
                    Some(kept) if *kept != prefix => warn!(
                        loader = loader.name(),
                        kept = %kept,
                        ignored = %prefix,
                        "资源前缀已由前序加载器确定，忽略"
                    ),
                    Some(_) => {}
                }
            }
            policies.extend(result.policies);
        }

        info!(
            loaded = policies.len(),
            resource_prefix = resource_prefix.as_deref().unwrap_or_default(),
            "多源策略加载完成"
        );
        Ok(LoadResult::new(resource_prefix, policies))
    }

    fn is_filtered(&self) -> bool {
        self.loaders.iter().any(|loader| loader.is_filtered())
    }

    fn set_filtered(&self, filtered: bool) {
        for loader in &self.loaders {
            loader.set_filtered(filtered);
        }
    }
}
