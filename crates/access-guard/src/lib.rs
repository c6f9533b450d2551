//! 策略聚合与鉴权门面
//!
//! 把数据库、远程策略 API、进程内生成器和类型化提供者等异构策略源的规则
//! 汇总到同一个 casbin 模型中，对外提供统一的 `has_permission` / `require_permission`。
//!
//! - [`rule`]: 规范化规则
//! - [`loaders`]: 策略加载器及多源聚合
//! - [`query`]: 查询/请求头提供者
//! - [`enforcer`]: 鉴权门面
//! - [`lifecycle`]: 共享/独立实例管理
//! - [`adapter`] / [`definition`]: 与 casbin 的衔接（适配器、模型定义）

pub mod adapter;
pub mod definition;
pub mod enforcer;
pub mod entities;
pub mod error;
pub mod lifecycle;
pub mod loaders;
pub mod query;
pub mod rule;

pub use adapter::PolicyTarget;
pub use definition::{ModelSource, PolicyShape};
pub use enforcer::{Actions, EnforcerState, LoadStatus, PermissionsEnforcer};
pub use entities::{Filter, PolicySelector, Role, User};
pub use error::{AccessGuardError, Result};
pub use lifecycle::EnforcerFactory;
pub use loaders::{LoaderSources, PolicyLoader, build_policy_loader};
pub use rule::{Effect, LoadResult, NormalizedRule};
