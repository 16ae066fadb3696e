//! 远端状态访问模块
//!
//! 远端对象只通过乐观并发修改：读取、在副本上应用变更、比较、有变化才写回，
//! 冲突时重新读取并重试。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use conncheck_common::{ConnectivityCheckStatus, Error, Result};

#[cfg(test)]
use mockall::automock;

/// 带资源版本的状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// 资源版本，写回时用于冲突检测
    pub resource_version: Option<String>,
    /// 状态内容
    pub status: ConnectivityCheckStatus,
}

/// 远端状态访问能力
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// 读取检查对象的当前状态
    async fn get_status(&self, name: &str) -> Result<StatusSnapshot>;

    /// 写回状态，资源版本过期时返回 `Error::Conflict`
    async fn update_status(&self, name: &str, snapshot: StatusSnapshot) -> Result<StatusSnapshot>;
}

/// 重试参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最多尝试次数
    pub max_attempts: u32,
    /// 首次重试前的等待（毫秒）
    pub initial_backoff_ms: u64,
    /// 每次重试等待时间的增长倍数
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            factor: 2.0,
        }
    }
}

/// 执行异步操作，遇到可重试错误时按指数退避重试
pub async fn retry_on_conflict<F, Fut, T>(policy: &RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut delay = Duration::from_millis(policy.initial_backoff_ms);

    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                debug!("尝试 {} 失败，{:?} 后重试: {}", attempt, delay, e);
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(policy.factor.max(1.0));
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!("重试 {} 次后仍然失败: {}", attempts, e);
                }
                return Err(e);
            }
        }
    }

    Err(Error::Unknown("重试失败，但没有错误信息".to_string()))
}

/// 内存中的状态存储，按资源版本做冲突检测
#[derive(Debug, Default)]
pub struct MemoryStatusClient {
    objects: Mutex<HashMap<String, (u64, ConnectivityCheckStatus)>>,
}

impl MemoryStatusClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个状态为空的检查对象
    pub fn insert(&self, name: &str) {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), (1, ConnectivityCheckStatus::default()));
    }

    /// 当前状态
    pub fn status(&self, name: &str) -> Option<ConnectivityCheckStatus> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|(_, status)| status.clone())
    }
}

#[async_trait]
impl StatusClient for MemoryStatusClient {
    async fn get_status(&self, name: &str) -> Result<StatusSnapshot> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        let (version, status) = objects
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(StatusSnapshot {
            resource_version: Some(version.to_string()),
            status: status.clone(),
        })
    }

    async fn update_status(&self, name: &str, snapshot: StatusSnapshot) -> Result<StatusSnapshot> {
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        let (version, status) = objects
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        if let Some(expected) = &snapshot.resource_version {
            if *expected != version.to_string() {
                return Err(Error::Conflict(format!(
                    "{} 的资源版本 {} 已过期，当前为 {}",
                    name, expected, version
                )));
            }
        }

        *version += 1;
        *status = snapshot.status;
        Ok(StatusSnapshot {
            resource_version: Some(version.to_string()),
            status: status.clone(),
        })
    }
}
