//! 故障追踪模块
//!
//! 根据成功/失败日志推导故障区间与 `Reachable` 条件。是否处于故障状态不单独保存，
//! 每次都通过比较最新失败与最新成功日志的时间得出，因此对同一日志重复执行不会产生变化。

use chrono::{Duration, SecondsFormat};
use tracing::{info, warn};

use conncheck_common::{
    Condition, ConditionStatus, ConnectivityCheckStatus, LogEntry, OutageEntry,
    MAX_OUTAGE_ENTRIES, MAX_OUTAGE_LOG_ENTRIES, REACHABLE_CONDITION,
};

use crate::recorder::Notice;

/// 故障开始事件原因
pub const OUTAGE_DETECTED_REASON: &str = "ConnectivityOutageDetected";
/// 故障恢复事件原因
pub const CONNECTIVITY_RESTORED_REASON: &str = "ConnectivityRestored";

fn newer(a: Option<&LogEntry>, b: Option<&LogEntry>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.start > b.start,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// 根据最新日志更新故障列表，返回需要发送的事件
pub fn update_outages(status: &mut ConnectivityCheckStatus) -> Option<Notice> {
    let latest_success = status.latest_success().cloned();
    let latest_failure = status.latest_failure().cloned();
    let failing = newer(latest_failure.as_ref(), latest_success.as_ref());
    let recovered = newer(latest_success.as_ref(), latest_failure.as_ref());

    let notice = match status.current_outage_mut() {
        None => match latest_failure {
            Some(failure) if failing => Some(start_outage(status, failure)),
            _ => None,
        },
        Some(outage) => match (latest_failure, latest_success) {
            (Some(failure), _) if failing => {
                extend_outage(outage, failure);
                None
            }
            (_, Some(success)) if recovered => Some(end_outage(outage, success)),
            _ => None,
        },
    };

    status.outages.truncate(MAX_OUTAGE_ENTRIES);
    notice
}

fn start_outage(status: &mut ConnectivityCheckStatus, failure: LogEntry) -> Notice {
    warn!("检测到连通性故障: {}", failure.message);
    let notice = Notice::warning(
        OUTAGE_DETECTED_REASON,
        format!("Connectivity outage detected: {}", failure.message),
    );
    status.outages.insert(
        0,
        OutageEntry {
            start: failure.start,
            end: None,
            message: format!(
                "Connectivity outage detected at {}",
                failure.start.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            start_logs: vec![failure.clone()],
            end_logs: vec![failure],
        },
    );
    notice
}

fn extend_outage(outage: &mut OutageEntry, failure: LogEntry) {
    // endLogs 首条不旧于该失败日志，说明已经记录过
    let recorded = outage
        .end_logs
        .first()
        .map_or(false, |last| last.start >= failure.start);
    if recorded {
        return;
    }

    if outage.start_logs.len() < MAX_OUTAGE_LOG_ENTRIES
        && outage
            .start_logs
            .first()
            .map_or(true, |first| first.message != failure.message)
    {
        outage.start_logs.insert(0, failure.clone());
    }
    prepend_capped(&mut outage.end_logs, failure);
}

fn end_outage(outage: &mut OutageEntry, success: LogEntry) -> Notice {
    let elapsed = format_duration(success.start - outage.start);
    info!("连通性已恢复，故障持续 {}", elapsed);
    let notice = Notice::normal(
        CONNECTIVITY_RESTORED_REASON,
        format!("Connectivity restored after {}: {}", elapsed, success.message),
    );
    outage.end = Some(success.start);
    outage.message = format!("Connectivity restored after {}", elapsed);
    prepend_capped(&mut outage.end_logs, success);
    notice
}

fn prepend_capped(logs: &mut Vec<LogEntry>, entry: LogEntry) {
    logs.insert(0, entry);
    logs.truncate(MAX_OUTAGE_LOG_ENTRIES);
}

/// 根据故障列表与日志重新计算 `Reachable` 条件
pub fn update_reachable_condition(status: &mut ConnectivityCheckStatus) {
    let reachable = status.outages.first().map_or(true, |o| !o.is_ongoing());

    let condition = if reachable {
        match status.latest_success() {
            Some(success) => reachable_condition(ConditionStatus::True, success),
            None => Condition {
                type_: REACHABLE_CONDITION.to_string(),
                status: ConditionStatus::Unknown,
                reason: "NoProbeResults".to_string(),
                message: "No successful probe has been recorded yet".to_string(),
                last_transition_time: status.latest_failure().map(|f| f.start),
            },
        }
    } else {
        match status.latest_failure() {
            Some(failure) => reachable_condition(ConditionStatus::False, failure),
            None => return,
        }
    };

    status.set_condition(condition);
}

fn reachable_condition(status: ConditionStatus, entry: &LogEntry) -> Condition {
    Condition {
        type_: REACHABLE_CONDITION.to_string(),
        status,
        reason: entry.reason.to_string(),
        message: entry.message.clone(),
        last_transition_time: Some(entry.start),
    }
}

/// 以 `1h2m3s` 的形式输出持续时间
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds();
    if total <= 0 {
        return format!("{}ms", duration.num_milliseconds().max(0));
    }

    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
