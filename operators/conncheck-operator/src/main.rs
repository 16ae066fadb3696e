use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conncheck_agent::config::ConfigManager;
use conncheck_agent::Agent;
use conncheck_operator::{ConncheckOperator, OperatorOptions};

/// 为本 Pod 负责的 PodNetworkConnectivityCheck 运行连通性检查
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(long, env = "CONNCHECK_CONFIG")]
    config: Option<String>,

    /// 监听的命名空间
    #[arg(long, env = "POD_NAMESPACE", default_value = "openshift-network-diagnostics")]
    namespace: String,

    /// 本 Pod 名称，只处理源 Pod 与之相同的检查
    #[arg(long, env = "POD_NAME")]
    pod_name: String,

    /// 事件中的组件名
    #[arg(long, default_value = "check-endpoints")]
    component: String,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("监听停止信号失败: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager = match &args.config {
        Some(path) => ConfigManager::new(path)?,
        None => ConfigManager::from_env()?,
    };
    let config = manager.get_config().clone();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("无效的日志级别")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let agent = Arc::new(Agent::new(config)?);
    agent.start_metrics_server()?;

    let client = kube::Client::try_default()
        .await
        .context("创建 Kubernetes 客户端失败")?;
    let operator = ConncheckOperator::new(
        client,
        agent,
        OperatorOptions {
            namespace: args.namespace,
            pod_name: args.pod_name,
            component: args.component,
        },
    );

    info!("Conncheck Operator 启动");
    operator.run(shutdown_signal()).await?;
    info!("Conncheck Operator 已停止");
    Ok(())
}
