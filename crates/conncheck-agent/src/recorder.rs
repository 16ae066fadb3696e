//! 事件记录与退避模块
//!
//! 该模块定义事件发送能力 `Recorder`，以及包装任意 `Recorder` 的
//! `BackoffRecorder`：事件频率过高时暂停逐条发送，改为缓存并在退避结束后
//! 按 (类型, 原因) 汇总成一条事件发送。

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    /// 普通事件
    Normal,
    /// 告警事件
    Warning,
}

/// 事件发送能力
#[cfg_attr(test, automock)]
pub trait Recorder: Send + Sync {
    /// 发送普通事件
    fn event(&self, reason: &str, message: &str);

    /// 发送告警事件
    fn warning(&self, reason: &str, message: &str);
}

/// 一条待发送的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

impl Notice {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// 通过指定的 Recorder 发送
    pub fn emit(&self, recorder: &dyn Recorder) {
        match self.type_ {
            EventType::Normal => recorder.event(&self.reason, &self.message),
            EventType::Warning => recorder.warning(&self.reason, &self.message),
        }
    }
}

/// 退避参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// 短窗口长度（秒）
    pub short_window_secs: u64,
    /// 短窗口内允许的最大事件数
    pub short_window_max: u32,
    /// 长窗口长度（秒）
    pub long_window_secs: u64,
    /// 长窗口内允许的最大事件数
    pub long_window_max: u32,
    /// 退避时长（秒）
    pub backoff_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            short_window_secs: 30,
            short_window_max: 30,
            long_window_secs: 600,
            long_window_max: 600,
            backoff_secs: 1800,
        }
    }
}

/// 缓存中的一条事件
#[derive(Debug, Clone)]
struct EventRecord {
    timestamp: DateTime<Utc>,
    message: String,
}

/// 非阻塞的周期计时器，只在被询问时检查是否到期
#[derive(Debug)]
struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    fn start(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: now + period,
        }
    }

    /// 到期则返回 true 并开始下一个周期
    fn fired(&mut self, now: Instant) -> bool {
        if now >= self.next {
            self.next = now + self.period;
            true
        } else {
            false
        }
    }
}

/// 滑动计数窗口
#[derive(Debug)]
struct Window {
    ticker: Ticker,
    count: u32,
    max: u32,
}

impl Window {
    fn new(period: Duration, max: u32, now: Instant) -> Self {
        Self {
            ticker: Ticker::start(period, now),
            count: 0,
            max,
        }
    }

    fn record(&mut self, now: Instant) {
        if self.ticker.fired(now) {
            self.count = 0;
        }
        self.count += 1;
    }

    fn exceeded(&self) -> bool {
        self.count > self.max
    }
}

#[derive(Debug)]
struct BackoffState {
    buffer: BTreeMap<(EventType, String), Vec<EventRecord>>,
    backoff: Option<Ticker>,
    short: Window,
    long: Window,
}

/// 带退避的事件记录器
pub struct BackoffRecorder {
    sink: Arc<dyn Recorder>,
    backoff_period: Duration,
    state: Mutex<BackoffState>,
}

impl BackoffRecorder {
    /// 包装一个事件发送端
    pub fn new(sink: Arc<dyn Recorder>, config: &BackoffConfig) -> Self {
        let now = Instant::now();
        Self {
            sink,
            backoff_period: Duration::from_secs(config.backoff_secs),
            state: Mutex::new(BackoffState {
                buffer: BTreeMap::new(),
                backoff: None,
                short: Window::new(
                    Duration::from_secs(config.short_window_secs),
                    config.short_window_max,
                    now,
                ),
                long: Window::new(
                    Duration::from_secs(config.long_window_secs),
                    config.long_window_max,
                    now,
                ),
            }),
        }
    }

    /// 当前是否处于退避状态
    pub fn is_backing_off(&self) -> bool {
        self.lock_state().backoff.is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, BackoffState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, type_: EventType, reason: &str, message: &str) {
        let pending = {
            let mut state = self.lock_state();
            let now = Instant::now();

            state
                .buffer
                .entry((type_, reason.to_string()))
                .or_default()
                .push(EventRecord {
                    timestamp: Utc::now(),
                    message: message.to_string(),
                });

            if let Some(ticker) = state.backoff.as_mut() {
                if !ticker.fired(now) {
                    debug!("事件退避中，缓存事件 {}", reason);
                    return;
                }
                state.backoff = None;
                state.short.count = 0;
                state.long.count = 0;
                info!("事件退避结束，发送缓存的事件");
            }

            state.short.record(now);
            state.long.record(now);

            if state.short.exceeded() || state.long.exceeded() {
                warn!(
                    "事件频率过高，进入退避 {:?} (短窗口 {} 条, 长窗口 {} 条)",
                    self.backoff_period, state.short.count, state.long.count
                );
                state.backoff = Some(Ticker::start(self.backoff_period, now));
                return;
            }

            std::mem::take(&mut state.buffer)
        };

        for ((type_, reason), records) in pending {
            let notice = Notice {
                type_,
                reason,
                message: summarize(&records),
            };
            notice.emit(self.sink.as_ref());
        }
    }
}

impl Recorder for BackoffRecorder {
    fn event(&self, reason: &str, message: &str) {
        self.record(EventType::Normal, reason, message);
    }

    fn warning(&self, reason: &str, message: &str) {
        self.record(EventType::Warning, reason, message);
    }
}

/// 合并同一原因的多条事件消息，单条消息原样返回
fn summarize(records: &[EventRecord]) -> String {
    match records {
        [single] => single.message.clone(),
        _ => records
            .iter()
            .map(|r| {
                format!(
                    "{}: {}",
                    r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                    r.message
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
