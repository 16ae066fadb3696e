//! 更新排序队列
//!
//! 同一目标的多次探测各自异步完成，网络抖动可能导致后开始的探测先完成。
//! 该队列短暂缓存更新以恢复时间戳顺序，同时保证等待时间有上限：
//! 缺失的更新不会让后续更新无限期滞留。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use conncheck_common::{Error, Result};

use crate::mutation::{PendingUpdate, StatusMutation};

/// 处理已排序更新的能力
#[async_trait]
pub trait UpdateProcessor: Send + Sync {
    /// 按时间顺序处理一批更新
    async fn process(&self, updates: Vec<PendingUpdate>);
}

/// 队列参数
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// 探测周期
    pub check_period: Duration,
    /// 探测超时
    pub check_timeout: Duration,
    /// 距上次放行小于该值的更新视为"预期的下一个"，默认两倍探测周期
    pub release_window: Option<Duration>,
    /// 处理缓冲超过该批数时才交给处理器
    pub batch_threshold: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    sorting: BTreeMap<DateTime<Utc>, Vec<StatusMutation>>,
    last_timestamp: Option<DateTime<Utc>>,
    processing: Vec<PendingUpdate>,
}

/// 按逻辑时间戳排序的更新队列
pub struct UpdateQueue {
    release_window: chrono::Duration,
    max_delay: chrono::Duration,
    batch_threshold: usize,
    processor: Arc<dyn UpdateProcessor>,
    state: Mutex<QueueState>,
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::Config(format!("无效的时长 {:?}: {}", duration, e)))
}

impl UpdateQueue {
    /// 创建新的更新队列
    pub fn new(config: &QueueConfig, processor: Arc<dyn UpdateProcessor>) -> Result<Self> {
        let release_window = config.release_window.unwrap_or(config.check_period * 2);
        Ok(Self {
            release_window: to_chrono(release_window)?,
            max_delay: to_chrono(config.check_timeout + config.check_period)?,
            batch_threshold: config.batch_threshold,
            processor,
            state: Mutex::new(QueueState::default()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 加入一批更新，并放行所有可以按序交付的更新
    pub fn add(&self, timestamp: DateTime<Utc>, operations: Vec<StatusMutation>) {
        let mut state = self.lock_state();
        state.sorting.entry(timestamp).or_default().extend(operations);

        let newest = match state.sorting.keys().next_back() {
            Some(newest) => *newest,
            None => return,
        };

        let pending: Vec<_> = state.sorting.keys().copied().collect();
        for t in pending {
            let expected_next = state
                .last_timestamp
                .map_or(true, |last| t - last < self.release_window);
            let overdue = newest - t > self.max_delay;
            if !expected_next && !overdue {
                // 后续时间戳更晚，同样不满足放行条件
                debug!("暂缓更新 {}，等待更早的探测结果", t);
                break;
            }

            if let Some(operations) = state.sorting.remove(&t) {
                state.last_timestamp = Some(t);
                state.processing.push(PendingUpdate {
                    timestamp: t,
                    operations,
                });
            }
        }
    }

    /// 把已放行的更新交给处理器
    ///
    /// `flush` 为 true 时（关闭前）连同排序缓冲中的所有更新一起按时间顺序交付。
    pub async fn process(&self, flush: bool) {
        let updates = {
            let mut state = self.lock_state();
            if flush {
                let sorting = std::mem::take(&mut state.sorting);
                for (timestamp, operations) in sorting {
                    state.last_timestamp = Some(timestamp);
                    state.processing.push(PendingUpdate {
                        timestamp,
                        operations,
                    });
                }
            } else if state.processing.len() <= self.batch_threshold {
                return;
            }
            std::mem::take(&mut state.processing)
        };

        if updates.is_empty() {
            return;
        }
        debug!("处理 {} 批状态更新", updates.len());
        self.processor.process(updates).await;
    }

    /// 排序缓冲中等待的批数
    pub fn pending_len(&self) -> usize {
        self.lock_state().sorting.len()
    }

    /// 已放行但尚未处理的批数
    pub fn released_len(&self) -> usize {
        self.lock_state().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Default)]
    struct CollectingProcessor {
        batches: Mutex<Vec<Vec<DateTime<Utc>>>>,
    }

    impl CollectingProcessor {
        fn delivered(&self) -> Vec<DateTime<Utc>> {
            self.batches.lock().unwrap().iter().flatten().copied().collect()
        }
    }

    #[async_trait]
    impl UpdateProcessor for CollectingProcessor {
        async fn process(&self, updates: Vec<PendingUpdate>) {
            self.batches
                .lock()
                .unwrap()
                .push(updates.into_iter().map(|u| u.timestamp).collect());
        }
    }

    const PERIOD: i64 = 60;
    const TIMEOUT: i64 = 10;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn queue(threshold: usize) -> (UpdateQueue, Arc<CollectingProcessor>) {
        let processor = Arc::new(CollectingProcessor::default());
        let config = QueueConfig {
            check_period: Duration::from_secs(PERIOD as u64),
            check_timeout: Duration::from_secs(TIMEOUT as u64),
            release_window: None,
            batch_threshold: threshold,
        };
        (UpdateQueue::new(&config, processor.clone()).unwrap(), processor)
    }

    #[tokio::test]
    async fn test_in_order_updates_released_immediately() {
        let (queue, processor) = queue(20);
        for i in 0..5 {
            queue.add(at(i * PERIOD), vec![StatusMutation::RecomputeOutages]);
        }
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.released_len(), 5);

        // 未超过批量阈值时不处理
        queue.process(false).await;
        assert!(processor.delivered().is_empty());

        queue.process(true).await;
        assert_eq!(
            processor.delivered(),
            (0..5).map(|i| at(i * PERIOD)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_out_of_order_updates_reordered() {
        let (queue, processor) = queue(20);
        queue.add(at(0), vec![]);
        // t=120 与 t=0 相差两个周期，等待 t=60
        queue.add(at(2 * PERIOD), vec![]);
        assert_eq!(queue.pending_len(), 1);

        queue.add(at(PERIOD), vec![]);
        assert_eq!(queue.pending_len(), 0);

        queue.process(true).await;
        assert_eq!(processor.delivered(), vec![at(0), at(PERIOD), at(2 * PERIOD)]);
    }

    #[tokio::test]
    async fn test_missing_update_does_not_stall() {
        let (queue, processor) = queue(20);
        queue.add(at(0), vec![]);

        // t=60 的探测从未到达
        queue.add(at(2 * PERIOD), vec![]);
        queue.add(at(2 * PERIOD + 30), vec![]);
        assert_eq!(queue.pending_len(), 2);

        // 最新时间戳超过 t=120 达到 timeout + period 后强制放行
        queue.add(at(2 * PERIOD + PERIOD + TIMEOUT + 1), vec![]);
        assert_eq!(queue.pending_len(), 0);

        queue.process(true).await;
        assert_eq!(
            processor.delivered(),
            vec![
                at(0),
                at(2 * PERIOD),
                at(2 * PERIOD + 30),
                at(3 * PERIOD + TIMEOUT + 1)
            ]
        );
    }

    #[tokio::test]
    async fn test_batch_threshold_triggers_processing() {
        let (queue, processor) = queue(3);
        for i in 0..3 {
            queue.add(at(i * PERIOD), vec![]);
        }
        queue.process(false).await;
        assert!(processor.delivered().is_empty());

        queue.add(at(3 * PERIOD), vec![]);
        queue.process(false).await;
        assert_eq!(processor.delivered().len(), 4);
        assert_eq!(queue.released_len(), 0);
    }

    #[tokio::test]
    async fn test_flush_drains_sorting_buffer_in_order() {
        let (queue, processor) = queue(20);
        queue.add(at(0), vec![]);
        queue.add(at(5 * PERIOD), vec![]);
        queue.add(at(4 * PERIOD), vec![]);
        assert_eq!(queue.pending_len(), 2);

        queue.process(true).await;
        assert_eq!(
            processor.delivered(),
            vec![at(0), at(4 * PERIOD), at(5 * PERIOD)]
        );
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_same_timestamp_merges_operations() {
        let processor = Arc::new(CollectingProcessor::default());
        let config = QueueConfig {
            check_period: Duration::from_secs(60),
            check_timeout: Duration::from_secs(10),
            release_window: Some(Duration::from_secs(1)),
            batch_threshold: 20,
        };
        let queue = UpdateQueue::new(&config, processor).unwrap();
        queue.add(at(0), vec![StatusMutation::RecomputeOutages]);
        queue.add(at(30), vec![StatusMutation::RecomputeOutages]);
        queue.add(at(30), vec![StatusMutation::RecomputeCondition]);
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.released_len(), 1);
    }
}
