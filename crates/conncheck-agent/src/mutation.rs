//! 状态变更操作
//!
//! 每次探测产生一组有序的状态变更，由更新队列排序后批量应用到远端对象的状态副本上。

use chrono::{DateTime, Utc};

use conncheck_common::{ConnectivityCheckStatus, LogEntry};

use crate::outage::{update_outages, update_reachable_condition};
use crate::recorder::Notice;

/// 单个状态变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMutation {
    /// 追加成功日志
    AddSuccess(LogEntry),
    /// 追加失败日志
    AddFailure(LogEntry),
    /// 重新计算故障列表
    RecomputeOutages,
    /// 重新计算 `Reachable` 条件
    RecomputeCondition,
}

impl StatusMutation {
    /// 应用到状态上，故障变化产生的事件追加到 `notices`
    pub fn apply(&self, status: &mut ConnectivityCheckStatus, notices: &mut Vec<Notice>) {
        match self {
            StatusMutation::AddSuccess(entry) => status.add_success_log_entry(entry.clone()),
            StatusMutation::AddFailure(entry) => status.add_failure_log_entry(entry.clone()),
            StatusMutation::RecomputeOutages => notices.extend(update_outages(status)),
            StatusMutation::RecomputeCondition => update_reachable_condition(status),
        }
    }
}

/// 一次探测产生的待应用变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    /// 逻辑时间戳，仅用于排序
    pub timestamp: DateTime<Utc>,
    /// 按顺序应用的变更
    pub operations: Vec<StatusMutation>,
}

/// 依次应用一组变更
pub fn apply_all<'a>(
    status: &mut ConnectivityCheckStatus,
    operations: impl IntoIterator<Item = &'a StatusMutation>,
) -> Vec<Notice> {
    let mut notices = Vec::new();
    for operation in operations {
        operation.apply(status, &mut notices);
    }
    notices
}
