//! 连接监控模块
//!
//! 每个检查目标对应一个 `ConnectionMonitor`：探测任务按周期触发，每次探测在独立任务中
//! 执行，结果经排序队列后由处理任务批量写回远端状态。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use conncheck_common::{CheckTarget, Result};

use crate::certs::CertificateSource;
use crate::client::{retry_on_conflict, RetryPolicy, StatusClient};
use crate::metrics::CheckMetrics;
use crate::mutation::{apply_all, PendingUpdate, StatusMutation};
use crate::probe::ProbeExecutor;
use crate::queue::{QueueConfig, UpdateProcessor, UpdateQueue};
use crate::recorder::{Notice, Recorder};
use crate::synthesizer::synthesize;

/// 监控参数
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// 探测周期
    pub check_period: Duration,
    /// 单次探测超时
    pub check_timeout: Duration,
    /// 处理周期
    pub process_period: Duration,
    /// 排序队列参数
    pub queue: QueueConfig,
    /// 写回冲突时的重试参数
    pub retry: RetryPolicy,
}

/// 监控依赖的外部能力
#[derive(Clone)]
pub struct MonitorContext {
    pub client: Arc<dyn StatusClient>,
    pub recorder: Arc<dyn Recorder>,
    pub certificates: Arc<dyn CertificateSource>,
    pub metrics: Arc<CheckMetrics>,
}

/// 把排序后的更新写回远端状态
struct StatusUpdater {
    name: String,
    client: Arc<dyn StatusClient>,
    recorder: Arc<dyn Recorder>,
    retry: RetryPolicy,
}

impl StatusUpdater {
    /// 读取、应用、比较，有变化时写回
    async fn apply_once(&self, operations: &[StatusMutation]) -> Result<Vec<Notice>> {
        let current = self.client.get_status(&self.name).await?;
        let mut updated = current.clone();
        let notices = apply_all(&mut updated.status, operations);

        if updated.status == current.status {
            debug!("{} 的状态没有变化，跳过写回", self.name);
            return Ok(notices);
        }
        self.client.update_status(&self.name, updated).await?;
        Ok(notices)
    }
}

#[async_trait]
impl UpdateProcessor for StatusUpdater {
    async fn process(&self, updates: Vec<PendingUpdate>) {
        let batches = updates.len();
        let operations: Vec<StatusMutation> =
            updates.into_iter().flat_map(|u| u.operations).collect();
        let operations = &operations;

        match retry_on_conflict(&self.retry, move || self.apply_once(operations)).await {
            Ok(notices) => {
                debug!("{} 写回 {} 批状态更新", self.name, batches);
                // 写入成功后才发送，重试不会产生重复事件
                for notice in &notices {
                    notice.emit(self.recorder.as_ref());
                }
            }
            Err(e) => warn!("更新 {} 的状态失败，丢弃 {} 批更新: {}", self.name, batches, e),
        }
    }
}

/// 执行单次探测并把结果加入队列
struct ProbeWorker {
    target: CheckTarget,
    executor: ProbeExecutor,
    certificates: Arc<dyn CertificateSource>,
    metrics: Arc<CheckMetrics>,
    queue: Arc<UpdateQueue>,
}

impl ProbeWorker {
    async fn check(&self) {
        let certificates = match self.certificates.client_certificates().await {
            Ok(certificates) => certificates,
            Err(e) => {
                warn!("获取 {} 的客户端证书失败: {}", self.target.name, e);
                Vec::new()
            }
        };

        let outcome = self
            .executor
            .probe(&self.target.target_endpoint, &certificates)
            .await;
        self.metrics.observe(&self.target, &outcome);

        let update = synthesize(&self.target, &outcome);
        self.queue.add(update.timestamp, update.operations);
    }
}

/// 单个目标的连接监控
pub struct ConnectionMonitor {
    target: CheckTarget,
    queue: Arc<UpdateQueue>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionMonitor {
    /// 创建并启动监控，需要在 tokio 运行时中调用
    pub fn start(
        target: CheckTarget,
        settings: &MonitorSettings,
        context: MonitorContext,
    ) -> Result<Self> {
        let updater = Arc::new(StatusUpdater {
            name: target.name.clone(),
            client: context.client,
            recorder: context.recorder,
            retry: settings.retry.clone(),
        });
        let queue = Arc::new(UpdateQueue::new(&settings.queue, updater)?);

        let worker = Arc::new(ProbeWorker {
            target: target.clone(),
            executor: ProbeExecutor::new(settings.check_timeout),
            certificates: context.certificates,
            metrics: context.metrics,
            queue: queue.clone(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(run_probes(
                worker,
                settings.check_period,
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_processing(
                queue.clone(),
                settings.process_period,
                shutdown_rx,
            )),
        ];

        info!("开始监控 {} ({})", target.name, target.target_endpoint);
        Ok(Self {
            target,
            queue,
            shutdown,
            tasks,
        })
    }

    /// 监控的目标
    pub fn target(&self) -> &CheckTarget {
        &self.target
    }

    /// 停止探测，并把队列中剩余的更新全部写回
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("{} 的监控任务异常退出: {}", self.target.name, e);
            }
        }

        self.queue.process(true).await;
        info!("停止监控 {}", self.target.name);
    }
}

async fn run_probes(
    worker: Arc<ProbeWorker>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut probes = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let worker = worker.clone();
                probes.spawn(async move { worker.check().await });
            }
            Some(result) = probes.join_next(), if !probes.is_empty() => {
                if let Err(e) = result {
                    warn!("探测任务异常退出: {}", e);
                }
            }
        }
    }

    // 未完成的探测直接放弃，不记录结果
    probes.abort_all();
    while probes.join_next().await.is_some() {}
}

async fn run_processing(
    queue: Arc<UpdateQueue>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => queue.process(false).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::StaticCertificates;
    use crate::client::{MemoryStatusClient, MockStatusClient, StatusSnapshot};
    use crate::outage::{CONNECTIVITY_RESTORED_REASON, OUTAGE_DETECTED_REASON};
    use crate::recorder::{BackoffConfig, BackoffRecorder, MockRecorder};
    use chrono::{TimeZone, Utc};
    use conncheck_common::{
        ConditionStatus, Error, LogEntry, LogEntryReason, REACHABLE_CONDITION,
    };
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    fn settings() -> MonitorSettings {
        let check_period = Duration::from_millis(100);
        let check_timeout = Duration::from_secs(1);
        MonitorSettings {
            check_period,
            check_timeout,
            process_period: Duration::from_millis(50),
            queue: QueueConfig {
                check_period,
                check_timeout,
                release_window: None,
                batch_threshold: 0,
            },
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                factor: 2.0,
            },
        }
    }

    fn target(endpoint: &str) -> CheckTarget {
        CheckTarget {
            name: "source-to-target".to_string(),
            source_pod: "source-0".to_string(),
            target_endpoint: endpoint.to_string(),
            tls_client_cert: None,
        }
    }

    fn context(client: Arc<dyn StatusClient>, recorder: MockRecorder) -> MonitorContext {
        MonitorContext {
            client,
            recorder: Arc::new(recorder),
            certificates: Arc::new(StaticCertificates::default()),
            metrics: Arc::new(CheckMetrics::new().unwrap()),
        }
    }

    fn failure_update(secs: i64) -> PendingUpdate {
        let start = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        PendingUpdate {
            timestamp: start,
            operations: vec![
                StatusMutation::AddFailure(LogEntry::failure(
                    start,
                    LogEntryReason::TcpConnectError,
                    "connection refused",
                    Duration::from_millis(1),
                )),
                StatusMutation::RecomputeOutages,
                StatusMutation::RecomputeCondition,
            ],
        }
    }

    fn success_update(secs: i64) -> PendingUpdate {
        let start = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        PendingUpdate {
            timestamp: start,
            operations: vec![
                StatusMutation::AddSuccess(LogEntry::success(
                    start,
                    LogEntryReason::TcpConnect,
                    "tcp connection succeeded",
                    Duration::from_millis(1),
                )),
                StatusMutation::RecomputeOutages,
                StatusMutation::RecomputeCondition,
            ],
        }
    }

    #[tokio::test]
    async fn test_monitor_records_successes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { while listener.accept().await.is_ok() {} });

        let client = Arc::new(MemoryStatusClient::new());
        client.insert("source-to-target");

        let monitor = ConnectionMonitor::start(
            target(&endpoint),
            &settings(),
            context(client.clone(), MockRecorder::new()),
        )
        .unwrap();
        time::sleep(Duration::from_millis(350)).await;
        monitor.stop().await;

        let status = client.status("source-to-target").unwrap();
        assert!(!status.successes.is_empty());
        assert!(status.failures.is_empty());
        assert!(status.outages.is_empty());
        assert!(status
            .successes
            .iter()
            .all(|e| e.reason == LogEntryReason::TcpConnect));
        assert_eq!(
            status.condition(REACHABLE_CONDITION).unwrap().status,
            ConditionStatus::True
        );
    }

    #[tokio::test]
    async fn test_monitor_reports_outage_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = Arc::new(MemoryStatusClient::new());
        client.insert("source-to-target");

        let mut recorder = MockRecorder::new();
        recorder
            .expect_warning()
            .with(eq(OUTAGE_DETECTED_REASON), mockall::predicate::always())
            .times(1)
            .return_const(());

        let monitor = ConnectionMonitor::start(
            target(&endpoint),
            &settings(),
            context(client.clone(), recorder),
        )
        .unwrap();
        time::sleep(Duration::from_millis(350)).await;
        monitor.stop().await;

        let status = client.status("source-to-target").unwrap();
        assert!(!status.failures.is_empty());
        assert_eq!(status.outages.len(), 1);
        assert!(status.outages[0].is_ongoing());
    }

    #[tokio::test]
    async fn test_updater_retries_conflict_and_emits_once() {
        let writes = Arc::new(AtomicU32::new(0));
        let mut client = MockStatusClient::new();
        client
            .expect_get_status()
            .returning(|_| Ok(StatusSnapshot::default()));
        let counter = writes.clone();
        client.expect_update_status().returning(move |_, snapshot| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Conflict("stale".into()))
            } else {
                Ok(snapshot)
            }
        });

        let mut recorder = MockRecorder::new();
        recorder
            .expect_warning()
            .with(eq(OUTAGE_DETECTED_REASON), mockall::predicate::always())
            .times(1)
            .return_const(());

        let updater = StatusUpdater {
            name: "source-to-target".to_string(),
            client: Arc::new(client),
            recorder: Arc::new(recorder),
            retry: settings().retry,
        };
        updater.process(vec![failure_update(0)]).await;
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_updater_drops_batch_after_exhaustion() {
        let mut client = MockStatusClient::new();
        client
            .expect_get_status()
            .times(3)
            .returning(|_| Ok(StatusSnapshot::default()));
        client
            .expect_update_status()
            .times(3)
            .returning(|_, _| Err(Error::Conflict("stale".into())));

        // 写回失败时不发送事件
        let updater = StatusUpdater {
            name: "source-to-target".to_string(),
            client: Arc::new(client),
            recorder: Arc::new(MockRecorder::new()),
            retry: settings().retry,
        };
        updater.process(vec![failure_update(0)]).await;
    }

    #[tokio::test]
    async fn test_updater_skips_unchanged_status() {
        let mut client = MockStatusClient::new();
        client
            .expect_get_status()
            .times(1)
            .returning(|_| Ok(StatusSnapshot::default()));
        client.expect_update_status().never();

        let updater = StatusUpdater {
            name: "source-to-target".to_string(),
            client: Arc::new(client),
            recorder: Arc::new(MockRecorder::new()),
            retry: settings().retry,
        };
        updater
            .process(vec![PendingUpdate {
                timestamp: Utc::now(),
                operations: vec![StatusMutation::RecomputeOutages],
            }])
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_updater_notices_pass_through_backoff() {
        let client = Arc::new(MemoryStatusClient::new());
        client.insert("source-to-target");

        let mut sink = MockRecorder::new();
        sink.expect_warning()
            .with(eq(OUTAGE_DETECTED_REASON), mockall::predicate::always())
            .times(2)
            .return_const(());
        sink.expect_event()
            .with(
                eq(CONNECTIVITY_RESTORED_REASON),
                mockall::predicate::function(|message: &str| message.lines().count() == 1),
            )
            .times(1)
            .return_const(());

        let config = BackoffConfig {
            short_window_max: 1,
            ..BackoffConfig::default()
        };
        let recorder = Arc::new(BackoffRecorder::new(Arc::new(sink), &config));
        let updater = StatusUpdater {
            name: "source-to-target".to_string(),
            client: client.clone(),
            recorder: recorder.clone(),
            retry: settings().retry,
        };

        // 第一条直接发送，第二条超过短窗口上限后被缓存
        updater.process(vec![failure_update(0)]).await;
        updater.process(vec![success_update(60)]).await;
        assert!(recorder.is_backing_off());

        time::advance(Duration::from_secs(config.backoff_secs + 1)).await;
        updater.process(vec![failure_update(120)]).await;
        assert!(!recorder.is_backing_off());

        let status = client.status("source-to-target").unwrap();
        assert_eq!(status.outages.len(), 2);
        assert!(status.outages[0].is_ongoing());
        assert!(!status.outages[1].is_ongoing());
    }
}
