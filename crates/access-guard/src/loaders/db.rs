//! 数据库策略加载器

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{error, info, instrument, warn};

use super::{PolicyLoader, insert_rules};
use crate::adapter::PolicyTarget;
use crate::entities::PolicySelector;
use crate::error::{AccessGuardError, Result};
use crate::query::{PolicyQuery, PolicyQueryProvider};
use crate::rule::{LoadResult, NormalizedRule};

/// 策略查询返回的一行
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PolicyRow {
    pub ptype: String,
    pub subject: String,
    pub object: String,
    pub action: Option<String>,
    pub effect: Option<String>,
}

impl PolicyRow {
    /// 权限行缺省 effect 按 allow 处理，分组行忽略 action/effect
    pub fn to_rule(&self) -> Result<NormalizedRule> {
        match self.ptype.trim() {
            "p" => NormalizedRule::from_fields(&[
                "p",
                self.subject.as_str(),
                self.object.as_str(),
                self.action.as_deref().unwrap_or_default(),
                self.effect.as_deref().unwrap_or("allow"),
            ]),
            "g" => NormalizedRule::from_fields(&["g", self.subject.as_str(), self.object.as_str()]),
            other => Err(AccessGuardError::InvalidPolicy(format!(
                "unknown policy type `{other}`"
            ))),
        }
    }
}

/// 执行策略查询的行数据来源
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyRowSource: Send + Sync {
    async fn fetch(&self, query: &PolicyQuery) -> Result<Vec<PolicyRow>>;
}

/// PostgreSQL 行数据来源
#[derive(Clone)]
pub struct PgRowSource {
    pool: PgPool,
}

impl PgRowSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyRowSource for PgRowSource {
    async fn fetch(&self, query: &PolicyQuery) -> Result<Vec<PolicyRow>> {
        let mut statement = sqlx::query_as::<_, PolicyRow>(&query.sql);
        for param in &query.params {
            statement = statement.bind(param.clone());
        }
        Ok(statement.fetch_all(&self.pool).await?)
    }
}

/// 数据库策略加载器
///
/// 查询语句由 [`PolicyQueryProvider`] 提供，加载器只负责执行和行到规则的转换。
/// 无法识别的行记录告警后跳过，连接或查询失败则整体失败。
pub struct PolicyDbLoader {
    rows: Arc<dyn PolicyRowSource>,
    query_provider: Arc<dyn PolicyQueryProvider>,
    filtered: AtomicBool,
}

impl PolicyDbLoader {
    pub fn new(rows: Arc<dyn PolicyRowSource>, query_provider: Arc<dyn PolicyQueryProvider>) -> Self {
        Self {
            rows,
            query_provider,
            filtered: AtomicBool::new(false),
        }
    }

    pub fn postgres(pool: PgPool, query_provider: Arc<dyn PolicyQueryProvider>) -> Self {
        Self::new(Arc::new(PgRowSource::new(pool)), query_provider)
    }
}

#[async_trait]
impl PolicyLoader for PolicyDbLoader {
    fn name(&self) -> &str {
        "db"
    }

    #[instrument(skip(self, target, selector), fields(selector = %selector.describe()))]
    async fn load_policy(
        &self,
        target: &mut PolicyTarget<'_>,
        selector: &PolicySelector,
    ) -> Result<LoadResult> {
        let query = self.query_provider.query_for(selector)?;

        let rows = self.rows.fetch(&query).await.map_err(|e| {
            error!(error = %e, "策略查询失败");
            e
        })?;

        let total = rows.len();
        let mut rules = Vec::with_capacity(total);
        for row in rows {
            match row.to_rule() {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(ptype = %row.ptype, subject = %row.subject, error = %e, "跳过无法识别的策略行"),
            }
        }

        let policies = insert_rules(target, self.name(), None, rules);
        info!(rows = total, loaded = policies.len(), "数据库策略加载完成");
        Ok(LoadResult::policies(policies))
    }

    fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }

    fn set_filtered(&self, filtered: bool) {
        self.filtered.store(filtered, Ordering::SeqCst);
    }
}
