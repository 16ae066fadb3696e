//! 连通性检查状态模型
//!
//! 该模块定义连通性检查写回到远端对象的状态：成功/失败日志、故障区间列表
//! 以及派生的 `Reachable` 条件。日志与故障列表均按开始时间倒序保存且有长度上限。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// 成功/失败日志的最大条数
pub const MAX_LOG_ENTRIES: usize = 10;
/// 单个故障区间内 startLogs/endLogs 的最大条数
pub const MAX_OUTAGE_LOG_ENTRIES: usize = 5;
/// 故障区间列表的最大条数
pub const MAX_OUTAGE_ENTRIES: usize = 20;

/// 可达性条件类型
pub const REACHABLE_CONDITION: &str = "Reachable";

/// 日志条目原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogEntryReason {
    /// 域名解析成功
    #[serde(rename = "DNSResolve")]
    DnsResolve,
    /// 域名解析失败
    #[serde(rename = "DNSError")]
    DnsError,
    /// TCP 连接成功
    #[serde(rename = "TCPConnect")]
    TcpConnect,
    /// TCP 连接失败
    #[serde(rename = "TCPConnectError")]
    TcpConnectError,
}

impl fmt::Display for LogEntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntryReason::DnsResolve => write!(f, "DNSResolve"),
            LogEntryReason::DnsError => write!(f, "DNSError"),
            LogEntryReason::TcpConnect => write!(f, "TCPConnect"),
            LogEntryReason::TcpConnectError => write!(f, "TCPConnectError"),
        }
    }
}

impl FromStr for LogEntryReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DNSResolve" => Ok(LogEntryReason::DnsResolve),
            "DNSError" => Ok(LogEntryReason::DnsError),
            "TCPConnect" => Ok(LogEntryReason::TcpConnect),
            "TCPConnectError" => Ok(LogEntryReason::TcpConnectError),
            _ => Err(Error::Serialization(format!("无效的日志原因: {}", s))),
        }
    }
}

/// 一次探测结果记录，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// 探测阶段开始时间
    pub start: DateTime<Utc>,
    /// 是否成功
    pub success: bool,
    /// 原因
    pub reason: LogEntryReason,
    /// 可读消息
    pub message: String,
    /// 耗时
    #[serde(with = "latency_seconds", default)]
    pub latency: Duration,
}

impl LogEntry {
    /// 创建成功日志
    pub fn success(
        start: DateTime<Utc>,
        reason: LogEntryReason,
        message: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            start,
            success: true,
            reason,
            message: message.into(),
            latency,
        }
    }

    /// 创建失败日志
    pub fn failure(
        start: DateTime<Utc>,
        reason: LogEntryReason,
        message: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            start,
            success: false,
            reason,
            message: message.into(),
            latency,
        }
    }
}

/// 以秒（浮点数）序列化耗时
mod latency_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!("无效的耗时: {}", secs)));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// 故障区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutageEntry {
    /// 故障开始时间
    pub start: DateTime<Utc>,
    /// 故障结束时间，`None` 表示仍在持续
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// 故障描述
    #[serde(default)]
    pub message: String,
    /// 故障开始阶段的日志（倒序）
    #[serde(default)]
    pub start_logs: Vec<LogEntry>,
    /// 故障结束阶段的日志（倒序）
    #[serde(default)]
    pub end_logs: Vec<LogEntry>,
}

impl OutageEntry {
    /// 故障是否仍在持续
    pub fn is_ongoing(&self) -> bool {
        self.end.is_none()
    }
}

/// 条件状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// 派生条件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// 条件类型
    #[serde(rename = "type")]
    pub type_: String,
    /// 条件状态
    pub status: ConditionStatus,
    /// 原因
    #[serde(default)]
    pub reason: String,
    /// 可读消息
    #[serde(default)]
    pub message: String,
    /// 状态上次发生变化的时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// 连通性检查状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityCheckStatus {
    /// 最近的成功日志（倒序）
    #[serde(default)]
    pub successes: Vec<LogEntry>,
    /// 最近的失败日志（倒序）
    #[serde(default)]
    pub failures: Vec<LogEntry>,
    /// 故障区间（倒序）
    #[serde(default)]
    pub outages: Vec<OutageEntry>,
    /// 派生条件
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConnectivityCheckStatus {
    /// 插入成功日志
    pub fn add_success_log_entry(&mut self, entry: LogEntry) {
        insert_log_entry(&mut self.successes, entry, MAX_LOG_ENTRIES);
    }

    /// 插入失败日志
    pub fn add_failure_log_entry(&mut self, entry: LogEntry) {
        insert_log_entry(&mut self.failures, entry, MAX_LOG_ENTRIES);
    }

    /// 最新的成功日志
    pub fn latest_success(&self) -> Option<&LogEntry> {
        self.successes.first()
    }

    /// 最新的失败日志
    pub fn latest_failure(&self) -> Option<&LogEntry> {
        self.failures.first()
    }

    /// 当前仍在持续的故障（只可能位于列表首位）
    pub fn current_outage(&self) -> Option<&OutageEntry> {
        self.outages.first().filter(|outage| outage.is_ongoing())
    }

    /// 当前仍在持续的故障（可变）
    pub fn current_outage_mut(&mut self) -> Option<&mut OutageEntry> {
        self.outages.first_mut().filter(|outage| outage.is_ongoing())
    }

    /// 按类型查找条件
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// 写入条件
    ///
    /// 状态未变化时保留原有的 `last_transition_time`，原因与消息总是刷新。
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }
}

/// 按开始时间倒序插入并截断
pub fn insert_log_entry(entries: &mut Vec<LogEntry>, entry: LogEntry, max: usize) {
    // 相同时间的新条目排在旧条目之前
    let index = entries.partition_point(|existing| existing.start > entry.start);
    entries.insert(index, entry);
    entries.truncate(max);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry(secs: i64, success: bool) -> LogEntry {
        let reason = if success {
            LogEntryReason::TcpConnect
        } else {
            LogEntryReason::TcpConnectError
        };
        LogEntry {
            start: at(secs),
            success,
            reason,
            message: format!("probe at {}", secs),
            latency: Duration::from_millis(5),
        }
    }

    #[rstest]
    #[case(vec![1, 2, 3, 4, 5])]
    #[case(vec![5, 4, 3, 2, 1])]
    #[case(vec![3, 1, 4, 15, 9, 2, 6, 5, 35, 8, 97, 12, 7])]
    #[case(vec![7, 7, 2, 7, 1])]
    fn test_log_entries_sorted_and_capped(#[case] order: Vec<i64>) {
        let mut status = ConnectivityCheckStatus::default();
        for secs in &order {
            status.add_success_log_entry(entry(*secs, true));
            status.add_failure_log_entry(entry(*secs, false));
        }

        for log in [&status.successes, &status.failures] {
            assert!(log.len() <= MAX_LOG_ENTRIES);
            assert_eq!(log.len(), order.len().min(MAX_LOG_ENTRIES));
            assert!(log.windows(2).all(|w| w[0].start >= w[1].start));
        }

        let mut expected = order.clone();
        expected.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(status.successes[0].start, at(expected[0]));
    }

    #[test]
    fn test_oldest_entry_dropped_when_full() {
        let mut status = ConnectivityCheckStatus::default();
        for secs in 0..MAX_LOG_ENTRIES as i64 {
            status.add_failure_log_entry(entry(secs, false));
        }
        // 比所有已有条目都旧的条目不会保留
        status.add_failure_log_entry(entry(-1, false));
        assert_eq!(status.failures.len(), MAX_LOG_ENTRIES);
        assert_eq!(status.failures.last().unwrap().start, at(0));

        status.add_failure_log_entry(entry(100, false));
        assert_eq!(status.failures[0].start, at(100));
        assert_eq!(status.failures.last().unwrap().start, at(1));
    }

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let mut status = ConnectivityCheckStatus::default();
        status.set_condition(Condition {
            type_: REACHABLE_CONDITION.to_string(),
            status: ConditionStatus::True,
            reason: "TCPConnect".to_string(),
            message: "first".to_string(),
            last_transition_time: Some(at(0)),
        });
        status.set_condition(Condition {
            type_: REACHABLE_CONDITION.to_string(),
            status: ConditionStatus::True,
            reason: "TCPConnect".to_string(),
            message: "second".to_string(),
            last_transition_time: Some(at(60)),
        });

        let condition = status.condition(REACHABLE_CONDITION).unwrap();
        assert_eq!(condition.message, "second");
        assert_eq!(condition.last_transition_time, Some(at(0)));
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_current_outage_only_when_ongoing() {
        let mut status = ConnectivityCheckStatus::default();
        assert!(status.current_outage().is_none());

        status.outages.push(OutageEntry {
            start: at(0),
            end: Some(at(10)),
            message: String::new(),
            start_logs: vec![],
            end_logs: vec![],
        });
        assert!(status.current_outage().is_none());

        status.outages.insert(
            0,
            OutageEntry {
                start: at(20),
                end: None,
                message: String::new(),
                start_logs: vec![],
                end_logs: vec![],
            },
        );
        assert_eq!(status.current_outage().map(|o| o.start), Some(at(20)));
    }

    #[test]
    fn test_status_serialization() {
        let mut status = ConnectivityCheckStatus::default();
        status.add_success_log_entry(entry(1, true));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["successes"][0]["reason"], "TCPConnect");
        assert_eq!(json["successes"][0]["latency"], 0.005);

        let parsed: ConnectivityCheckStatus = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn test_reason_from_str() {
        assert_eq!(
            "DNSError".parse::<LogEntryReason>().unwrap(),
            LogEntryReason::DnsError
        );
        assert!("Other".parse::<LogEntryReason>().is_err());
    }
}
