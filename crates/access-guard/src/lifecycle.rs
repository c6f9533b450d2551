//! 门面生命周期
//!
//! `EnforcerFactory` 是显式传递的句柄：共享模式下首次获取时构造一次并缓存，
//! 并发的首次获取只会构造一个实例；独立模式下每次获取都构造新实例。
//! 构造失败不会缓存任何实例，下次获取会重新尝试。

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use access_guard_shared::config::{EnforcerConfig, InstanceMode};

use crate::enforcer::PermissionsEnforcer;
use crate::error::{AccessGuardError, Result};
use crate::loaders::LoaderSources;

pub struct EnforcerFactory {
    config: EnforcerConfig,
    sources: LoaderSources,
    shared: OnceCell<Arc<PermissionsEnforcer>>,
}

impl EnforcerFactory {
    pub fn new(config: EnforcerConfig, sources: LoaderSources) -> Result<Self> {
        config.validate().map_err(AccessGuardError::Configuration)?;
        Ok(Self {
            config,
            sources,
            shared: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &EnforcerConfig {
        &self.config
    }

    /// 按配置的实例模式获取门面
    pub async fn get(&self) -> Result<Arc<PermissionsEnforcer>> {
        match self.config.instance_mode {
            InstanceMode::Shared => self.shared().await,
            InstanceMode::Fresh => self.fresh().await,
        }
    }

    /// 共享实例，首次调用时构造
    pub async fn shared(&self) -> Result<Arc<PermissionsEnforcer>> {
        self.shared
            .get_or_try_init(|| async {
                let enforcer = PermissionsEnforcer::new(&self.config, &self.sources).await?;
                info!("共享鉴权门面已创建");
                Ok::<_, AccessGuardError>(Arc::new(enforcer))
            })
            .await
            .cloned()
    }

    /// 总是构造新实例，不影响共享实例
    pub async fn fresh(&self) -> Result<Arc<PermissionsEnforcer>> {
        let enforcer = PermissionsEnforcer::new(&self.config, &self.sources).await?;
        Ok(Arc::new(enforcer))
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized()
    }
}
