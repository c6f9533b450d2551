//! 共享库
//!
//! 包含鉴权服务共用的配置、数据库连接与日志初始化代码。

pub mod config;
pub mod database;
pub mod observability;
