//! 日志合成模块
//!
//! 把一次探测结果转换为有序的状态变更与逻辑时间戳。

use conncheck_common::{CheckTarget, LogEntry, LogEntryReason};

use crate::mutation::{PendingUpdate, StatusMutation};
use crate::probe::{ProbeError, ProbeOutcome};

/// 根据探测结果生成待应用的状态变更
///
/// 域名解析失败时只产生一条 `DNSError` 失败日志；否则在发生解析时先产生一条
/// `DNSResolve` 成功日志，再产生 TCP 连接阶段的日志。逻辑时间戳取最早的日志时间。
pub fn synthesize(target: &CheckTarget, outcome: &ProbeOutcome) -> PendingUpdate {
    let trace = &outcome.trace;
    let mut operations = Vec::with_capacity(4);

    match (&outcome.error, trace.dns_start) {
        (Some(error @ ProbeError::Dns { .. }), dns_start) => {
            operations.push(StatusMutation::AddFailure(LogEntry::failure(
                dns_start.unwrap_or(trace.connect_start),
                LogEntryReason::DnsError,
                format!("{}: {}", target.name, error),
                trace.dns_duration,
            )));
        }
        (error, dns_start) => {
            if let (Some(dns_start), false) = (dns_start, trace.dns_duration.is_zero()) {
                operations.push(StatusMutation::AddSuccess(LogEntry::success(
                    dns_start,
                    LogEntryReason::DnsResolve,
                    format!(
                        "{}: resolved host name {} successfully",
                        target.name, target.target_endpoint
                    ),
                    trace.dns_duration,
                )));
            }

            operations.push(match error {
                Some(error) => StatusMutation::AddFailure(LogEntry::failure(
                    trace.connect_start,
                    LogEntryReason::TcpConnectError,
                    format!(
                        "{}: failed to establish a TCP connection to {}: {}",
                        target.name, target.target_endpoint, error
                    ),
                    trace.connect_duration,
                )),
                None => StatusMutation::AddSuccess(LogEntry::success(
                    trace.connect_start,
                    LogEntryReason::TcpConnect,
                    format!(
                        "{}: tcp connection to {} succeeded",
                        target.name, target.target_endpoint
                    ),
                    trace.connect_duration,
                )),
            });
        }
    }

    let timestamp = operations
        .iter()
        .filter_map(|op| match op {
            StatusMutation::AddSuccess(entry) | StatusMutation::AddFailure(entry) => {
                Some(entry.start)
            }
            _ => None,
        })
        .min()
        .unwrap_or(trace.connect_start);

    if !operations.is_empty() {
        operations.push(StatusMutation::RecomputeOutages);
        operations.push(StatusMutation::RecomputeCondition);
    }

    PendingUpdate {
        timestamp,
        operations,
    }
}
