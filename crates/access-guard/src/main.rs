//! 鉴权命令行工具
//!
//! 按 `ACCESS_GUARD_*` 配置加载策略，做单次判定或打印当前策略。
//!
//! ```bash
//! access-guard check --user 42 --resource /reports --action read --action export
//! access-guard policies --user 42
//! access-guard status
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use access_guard::query::IamPolicyQueryProvider;
use access_guard::{EnforcerFactory, LoaderSources, PolicySelector, User};
use access_guard_shared::config::{AppConfig, PolicyLoaderType};
use access_guard_shared::database::Database;
use access_guard_shared::observability;

#[derive(Parser, Debug)]
#[command(name = "access-guard")]
#[command(version, about = "策略聚合与鉴权工具")]
#[command(propagate_version = true)]
struct Cli {
    /// 服务名，决定额外读取的 config/{service}.toml
    #[arg(long, default_value = "access-guard")]
    service: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 判定用户能否对资源执行任一动作，无权限时以非零状态退出
    Check {
        #[arg(short, long)]
        user: String,

        /// 未限定前缀的资源标识
        #[arg(short, long)]
        resource: String,

        /// 可重复，任一动作允许即通过
        #[arg(short, long = "action", required = true)]
        actions: Vec<String>,

        /// 只加载该用户的策略
        #[arg(long)]
        scoped: bool,
    },

    /// 打印当前生效的策略行
    Policies {
        /// 只加载该用户的策略
        #[arg(short, long)]
        user: Option<String>,
    },

    /// 打印加载状态（JSON）
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.service).context("加载配置失败")?;
    observability::init(&config.observability)?;

    let mut sources = LoaderSources::new();
    if config
        .enforcer
        .policy_loader_types
        .contains(&PolicyLoaderType::Db)
    {
        let db = Database::connect(&config.database)
            .await
            .context("连接数据库失败")?;
        let missing = db.missing_tables(IamPolicyQueryProvider::TABLES).await?;
        if !missing.is_empty() {
            anyhow::bail!("策略库缺少表: {}", missing.join(", "));
        }
        sources = sources.with_pool(db.pool().clone());
    }

    let factory = EnforcerFactory::new(config.enforcer.clone(), sources)?;
    let enforcer = factory.get().await?;
    info!(service = %config.service_name, state = ?enforcer.state(), "鉴权门面就绪");

    match cli.command {
        Commands::Check {
            user,
            resource,
            actions,
            scoped,
        } => {
            if scoped {
                enforcer
                    .load_policy(PolicySelector::ByUser(User::new(user.clone())))
                    .await?;
            }
            enforcer.require_permission(&user, &resource, actions)?;
            println!("allow");
        }
        Commands::Policies { user } => {
            if let Some(user) = user {
                enforcer
                    .load_policy(PolicySelector::ByUser(User::new(user)))
                    .await?;
            }
            for line in enforcer.policy_lines() {
                println!("{line}");
            }
        }
        Commands::Status => {
            println!("{}", serde_json::to_string_pretty(&enforcer.load_status())?);
        }
    }

    Ok(())
}
