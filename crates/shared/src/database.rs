//! 策略库连接
//!
//! 数据库策略加载器读取的 IAM 表由上游管理服务维护，这里只建连接池，
//! 并在启动时确认这些表存在。

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument, warn};

use crate::config::DatabaseConfig;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!("策略库连接池已创建");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 返回当前 search_path 下不存在的表
    ///
    /// 会话临时表也算存在。
    pub async fn missing_tables(&self, tables: &[&str]) -> Result<Vec<String>, sqlx::Error> {
        let mut missing = Vec::new();
        for table in tables {
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(*table)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                warn!(table, "策略表不存在");
                missing.push(table.to_string());
            }
        }
        Ok(missing)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("策略库连接池已关闭");
    }
}
