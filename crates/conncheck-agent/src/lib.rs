//! Conncheck Agent - 周期性连通性探测
//!
//! 该模块实现连通性检查的核心：按周期探测目标地址，把探测结果合成为日志，
//! 经排序队列按时间顺序写回远端状态，追踪故障区间并以退避方式发送事件。

pub mod certs;
pub mod client;
pub mod config;
pub mod metrics;
pub mod monitor;
pub mod mutation;
pub mod outage;
pub mod probe;
pub mod queue;
pub mod recorder;
pub mod synthesizer;

use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use conncheck_common::CheckTarget;

use crate::certs::CertificateSource;
use crate::client::StatusClient;
use crate::config::AgentConfig;
use crate::metrics::CheckMetrics;
use crate::monitor::{ConnectionMonitor, MonitorContext};
use crate::recorder::{BackoffRecorder, Recorder};

/// Agent 主结构体，管理本 Pod 负责的全部连接监控
pub struct Agent {
    /// 配置
    config: AgentConfig,
    /// 指标
    metrics: Arc<CheckMetrics>,
    /// 按检查名称索引的监控
    monitors: RwLock<HashMap<String, ConnectionMonitor>>,
}

impl Agent {
    /// 创建新的 Agent 实例
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            metrics: Arc::new(CheckMetrics::new()?),
            monitors: RwLock::new(HashMap::new()),
        })
    }

    /// 启动指标服务器
    pub fn start_metrics_server(&self) -> Result<SocketAddr> {
        let addr = self.config.metrics.socket_addr()?;
        self.metrics.start_metrics_server(addr)
    }

    /// 确保目标有且只有一个运行中的监控
    ///
    /// 目标未变化时不做任何事并返回 false；目标变化时先停止旧监控再启动新监控。
    /// 事件发送端会被包装为 `BackoffRecorder`。
    pub async fn ensure_monitor(
        &self,
        target: CheckTarget,
        client: Arc<dyn StatusClient>,
        sink: Arc<dyn Recorder>,
        certificates: Arc<dyn CertificateSource>,
    ) -> Result<bool> {
        let previous = {
            let mut monitors = self.monitors.write().await;
            if let Some(existing) = monitors.get(&target.name) {
                if existing.target() == &target {
                    return Ok(false);
                }
            }
            monitors.remove(&target.name)
        };
        // 旧监控的最终写回可能较慢，不持有锁
        if let Some(previous) = previous {
            info!("{} 的检查目标已变化，重新启动监控", target.name);
            self.retire(previous).await;
        }

        let context = MonitorContext {
            client,
            recorder: Arc::new(BackoffRecorder::new(sink, &self.config.recorder)),
            certificates,
            metrics: self.metrics.clone(),
        };
        let monitor =
            ConnectionMonitor::start(target.clone(), &self.config.monitor_settings(), context)?;
        let raced = self.monitors.write().await.insert(target.name.clone(), monitor);
        if let Some(raced) = raced {
            // 同一目标的指标仍由新监控使用
            if raced.target() == &target {
                raced.stop().await;
            } else {
                self.retire(raced).await;
            }
        }
        Ok(true)
    }

    /// 停止指定检查的监控，返回是否存在该监控
    pub async fn stop_monitor(&self, name: &str) -> bool {
        let monitor = self.monitors.write().await.remove(name);
        match monitor {
            Some(monitor) => {
                self.retire(monitor).await;
                true
            }
            None => false,
        }
    }

    /// 停止监控并删除其指标
    async fn retire(&self, monitor: ConnectionMonitor) {
        let target = monitor.target().clone();
        monitor.stop().await;
        self.metrics.forget(&target);
    }

    /// 当前监控的检查目标
    pub async fn monitored_targets(&self) -> Vec<CheckTarget> {
        let mut targets: Vec<CheckTarget> = self
            .monitors
            .read()
            .await
            .values()
            .map(|m| m.target().clone())
            .collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets
    }

    /// 停止全部监控
    pub async fn stop(&self) -> Result<()> {
        let monitors: Vec<ConnectionMonitor> =
            self.monitors.write().await.drain().map(|(_, m)| m).collect();
        info!("停止 {} 个连接监控", monitors.len());
        futures::future::join_all(monitors.into_iter().map(|m| self.retire(m))).await;
        Ok(())
    }
}
