//! 资源协调模块
//!
//! 为源 Pod 是本 Pod 的每个 `PodNetworkConnectivityCheck` 保持一个运行中的连接监控；
//! 检查被删除、改派给其他 Pod 或规范变化时停止（或重启）对应监控。

use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    client::Client,
    runtime::{controller::Action, events::Reporter},
    Resource, ResourceExt,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use conncheck_agent::Agent;

use crate::certs::SecretCertificateSource;
use crate::crd::PodNetworkConnectivityCheck;
use crate::event_handler::KubeEventSink;
use crate::status::KubeStatusClient;

/// 协调错误
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("检查 {0} 没有命名空间")]
    MissingNamespace(String),

    #[error("启动 {name} 的连接监控失败: {reason}")]
    Monitor { name: String, reason: String },
}

/// 检查未被删除且源 Pod 为 `pod_name`
pub fn owned_by(check: &PodNetworkConnectivityCheck, pod_name: &str) -> bool {
    check.meta().deletion_timestamp.is_none() && check.spec.source_pod == pod_name
}

/// 协调器结构体
pub struct Reconciler {
    /// Kubernetes 客户端
    client: Client,
    /// 运行连接监控的 Agent
    agent: Arc<Agent>,
    /// 本 Pod 名称，只处理源 Pod 与之相同的检查
    pod_name: String,
    /// 事件上报者
    reporter: Reporter,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(client: Client, agent: Arc<Agent>, pod_name: String, reporter: Reporter) -> Self {
        Self {
            client,
            agent,
            pod_name,
            reporter,
        }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// 该检查是否应由本 Pod 监控
    pub fn owns(&self, check: &PodNetworkConnectivityCheck) -> bool {
        owned_by(check, &self.pod_name)
    }

    /// 协调单个检查
    pub async fn reconcile(
        &self,
        check: Arc<PodNetworkConnectivityCheck>,
    ) -> Result<Action, ReconcileError> {
        let name = check.name_any();

        if !self.owns(&check) {
            if self.agent.stop_monitor(&name).await {
                info!("检查 {} 不再由本 Pod 负责，已停止监控", name);
            } else {
                debug!("忽略其他 Pod 的检查 {}", name);
            }
            return Ok(Action::await_change());
        }

        let namespace = check
            .namespace()
            .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;
        let target = check.to_target();

        let status_client = Arc::new(KubeStatusClient::new(Api::namespaced(
            self.client.clone(),
            &namespace,
        )));
        let sink = Arc::new(KubeEventSink::new(
            self.client.clone(),
            self.reporter.clone(),
            check.object_ref(&()),
        ));
        let certificates = Arc::new(SecretCertificateSource::new(
            Api::<Secret>::namespaced(self.client.clone(), &namespace),
            target.tls_client_cert.clone(),
        ));

        let started = self
            .agent
            .ensure_monitor(target, status_client, sink, certificates)
            .await
            .map_err(|e| ReconcileError::Monitor {
                name: name.clone(),
                reason: format!("{:#}", e),
            })?;
        if started {
            info!("已为 {}/{} 启动连接监控", namespace, name);
        }

        Ok(Action::requeue(Duration::from_secs(300)))
    }

    /// 处理协调错误
    pub fn handle_error(
        &self,
        check: &PodNetworkConnectivityCheck,
        error: &ReconcileError,
    ) -> Action {
        warn!("协调检查 {} 失败: {}", check.name_any(), error);
        Action::requeue(Duration::from_secs(30))
    }

    /// 停止不在 `live` 中的监控，返回停止的数量
    pub async fn prune(&self, live: &HashSet<String>) -> usize {
        let mut stopped = 0;
        for target in self.agent.monitored_targets().await {
            if !live.contains(&target.name) && self.agent.stop_monitor(&target.name).await {
                info!("检查 {} 已不存在，停止监控", target.name);
                stopped += 1;
            }
        }
        stopped
    }
}
