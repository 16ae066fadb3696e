//! Conncheck Operator - 在 Kubernetes 中运行连通性检查
//!
//! 该模块把连接监控接入 Kubernetes：监听 `PodNetworkConnectivityCheck` 资源，
//! 为源 Pod 是本 Pod 的检查运行监控，通过 status 子资源写回结果并发布事件。

pub mod certs;
pub mod controller;
pub mod crd;
pub mod event_handler;
pub mod reconcile;
pub mod status;

use anyhow::Result;
use kube::runtime::events::Reporter;
use kube::Client;
use std::future::Future;
use std::sync::Arc;

use conncheck_agent::Agent;

/// Operator 运行参数
#[derive(Debug, Clone)]
pub struct OperatorOptions {
    /// 监听的命名空间
    pub namespace: String,
    /// 本 Pod 名称
    pub pod_name: String,
    /// 事件中的组件名
    pub component: String,
}

/// Operator 主结构体
pub struct ConncheckOperator {
    /// 控制器
    controller: controller::Controller,
}

impl ConncheckOperator {
    /// 创建新的 Operator 实例
    pub fn new(client: Client, agent: Arc<Agent>, options: OperatorOptions) -> Self {
        let reporter = Reporter {
            controller: options.component,
            instance: Some(options.pod_name.clone()),
        };
        let reconciler = Arc::new(reconcile::Reconciler::new(
            client.clone(),
            agent,
            options.pod_name,
            reporter,
        ));

        Self {
            controller: controller::Controller::new(client, options.namespace, reconciler),
        }
    }

    /// 运行 Operator 直到 `shutdown` 完成
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.controller.run(shutdown).await
    }
}
