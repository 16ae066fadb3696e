//! 控制器模块
//!
//! 监听命名空间内的 `PodNetworkConnectivityCheck`，把每次变化交给协调器；
//! 同时定期清理已删除检查对应的监控。

use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller as KubeController},
        reflector::Store,
        watcher,
    },
    ResourceExt,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::crd::PodNetworkConnectivityCheck;
use crate::reconcile::{ReconcileError, Reconciler};

const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// 控制器结构体
pub struct Controller {
    /// Kubernetes 客户端
    client: Client,
    /// 监听的命名空间
    namespace: String,
    /// 协调器
    reconciler: Arc<Reconciler>,
}

async fn reconcile(
    check: Arc<PodNetworkConnectivityCheck>,
    reconciler: Arc<Reconciler>,
) -> Result<Action, ReconcileError> {
    reconciler.reconcile(check).await
}

fn error_policy(
    check: Arc<PodNetworkConnectivityCheck>,
    error: &ReconcileError,
    reconciler: Arc<Reconciler>,
) -> Action {
    reconciler.handle_error(&check, error)
}

/// 本 Pod 应当监控的检查名称
fn live_checks(store: &Store<PodNetworkConnectivityCheck>, reconciler: &Reconciler) -> HashSet<String> {
    store
        .state()
        .iter()
        .filter(|check| reconciler.owns(check))
        .map(|check| check.name_any())
        .collect()
}

impl Controller {
    /// 创建新的控制器
    pub fn new(client: Client, namespace: String, reconciler: Arc<Reconciler>) -> Self {
        Self {
            client,
            namespace,
            reconciler,
        }
    }

    /// 运行控制器直到 `shutdown` 完成，随后停止全部监控
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let checks: Api<PodNetworkConnectivityCheck> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let controller = KubeController::new(checks, watcher::Config::default());
        let store = controller.store();

        let reconciler = self.reconciler.clone();
        let pruner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                ticker.tick().await;
                let live = live_checks(&store, &reconciler);
                let stopped = reconciler.prune(&live).await;
                if stopped > 0 {
                    info!("清理了 {} 个已删除检查的监控", stopped);
                }
            }
        });

        let run = controller
            .run(reconcile, error_policy, self.reconciler.clone())
            .for_each(|result| async move {
                match result {
                    Ok((object, _)) => debug!("协调成功: {}", object.name),
                    Err(e) => error!("协调错误: {}", e),
                }
            });

        info!("开始监听命名空间 {} 中的 PodNetworkConnectivityCheck", self.namespace);
        tokio::select! {
            _ = run => warn!("控制器意外退出"),
            _ = shutdown => info!("收到停止信号"),
        }

        pruner.abort();
        self.reconciler.agent().stop().await
    }
}
