//! 配置管理模块
//!
//! 配置来源依次为内置默认值、YAML/JSON 配置文件和 `CONNCHECK_` 前缀的环境变量，
//! 后者覆盖前者。嵌套字段的环境变量用 `__` 分隔，例如 `CONNCHECK_RETRY__MAX_ATTEMPTS`。

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use conncheck_common::error::IntoError;
use conncheck_common::Error;

use crate::client::RetryPolicy;
use crate::monitor::MonitorSettings;
use crate::queue::QueueConfig;
use crate::recorder::BackoffConfig;

/// Agent 配置结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// 探测周期（秒）
    pub check_period_secs: u64,
    /// 单次探测超时（秒）
    pub check_timeout_secs: u64,
    /// 状态更新的处理周期（秒）
    pub process_period_secs: u64,
    /// 已放行更新超过该批数时立即写回
    pub batch_threshold: usize,
    /// 排序队列的放行窗口（秒），不设置时为两倍探测周期
    pub release_window_secs: Option<u64>,
    /// 冲突重试参数
    pub retry: RetryPolicy,
    /// 事件退避参数
    pub recorder: BackoffConfig,
    /// 指标服务器配置
    pub metrics: MetricsConfig,
    /// 日志级别
    pub log_level: String,
}

/// 指标服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 监听地址
    pub listen_address: String,
    /// 监听端口
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

impl MetricsConfig {
    /// 解析监听地址
    pub fn socket_addr(&self) -> conncheck_common::Result<SocketAddr> {
        format!("{}:{}", self.listen_address, self.port)
            .parse()
            .map_err(|e| {
                Error::Config(format!(
                    "无效的指标监听地址 {}:{}: {}",
                    self.listen_address, self.port, e
                ))
            })
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        create_default_config()
    }
}

impl AgentConfig {
    /// 检查配置取值
    pub fn validate(&self) -> conncheck_common::Result<()> {
        if self.check_period_secs == 0 {
            return "check_period_secs 必须大于 0".into_error(Error::Config);
        }
        if self.check_timeout_secs == 0 {
            return "check_timeout_secs 必须大于 0".into_error(Error::Config);
        }
        if self.process_period_secs == 0 {
            return "process_period_secs 必须大于 0".into_error(Error::Config);
        }
        if self.release_window_secs == Some(0) {
            return "release_window_secs 必须大于 0".into_error(Error::Config);
        }
        if self.retry.max_attempts == 0 {
            return "retry.max_attempts 必须大于 0".into_error(Error::Config);
        }
        if self.recorder.short_window_secs == 0 || self.recorder.long_window_secs == 0 {
            return "recorder 的窗口长度必须大于 0".into_error(Error::Config);
        }
        self.metrics.socket_addr()?;
        Ok(())
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn process_period(&self) -> Duration {
        Duration::from_secs(self.process_period_secs)
    }

    /// 排序队列参数
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            check_period: self.check_period(),
            check_timeout: self.check_timeout(),
            release_window: self.release_window_secs.map(Duration::from_secs),
            batch_threshold: self.batch_threshold,
        }
    }

    /// 连接监控参数
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            check_period: self.check_period(),
            check_timeout: self.check_timeout(),
            process_period: self.process_period(),
            queue: self.queue_config(),
            retry: self.retry.clone(),
        }
    }
}

/// 配置管理器
pub struct ConfigManager {
    /// 当前配置
    config: AgentConfig,
}

impl ConfigManager {
    /// 从配置文件与环境变量加载配置
    pub fn new(config_path: &str) -> Result<Self> {
        let config_path = PathBuf::from(config_path);
        let config = Self::load_config(Some(&config_path))
            .context(format!("无法加载配置文件: {:?}", config_path))?;

        Ok(Self { config })
    }

    /// 只使用默认值与环境变量
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            config: Self::load_config(None)?,
        })
    }

    fn load_config(config_path: Option<&Path>) -> Result<AgentConfig> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            let config_file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => return Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
            };
            builder = builder.add_source(File::with_name(config_file).format(format));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("CONNCHECK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("构建配置失败")?;

        let agent_config = config
            .try_deserialize::<AgentConfig>()
            .context("配置格式错误")?;
        agent_config.validate()?;

        debug!("已加载配置: {:?}", agent_config);
        Ok(agent_config)
    }

    /// 获取完整配置
    pub fn get_config(&self) -> &AgentConfig {
        &self.config
    }
}

/// 创建默认配置
pub fn create_default_config() -> AgentConfig {
    AgentConfig {
        check_period_secs: 60,
        check_timeout_secs: 10,
        process_period_secs: 10,
        batch_threshold: 20,
        release_window_secs: None,
        retry: RetryPolicy::default(),
        recorder: BackoffConfig::default(),
        metrics: MetricsConfig::default(),
        log_level: "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_with_defaults() {
        let file = write_config(
            ".yaml",
            "check_period_secs: 30\nretry:\n  max_attempts: 3\nmetrics:\n  port: 9100\n",
        );
        let manager = ConfigManager::new(file.path().to_str().unwrap()).unwrap();
        let config = manager.get_config();

        assert_eq!(config.check_period_secs, 30);
        assert_eq!(config.check_timeout_secs, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.metrics.port, 9100);
        assert_eq!(config.metrics.listen_address, "0.0.0.0");
        assert_eq!(config.recorder, BackoffConfig::default());
    }

    #[test]
    fn test_load_json() {
        let file = write_config(".json", r#"{"batch_threshold": 5, "release_window_secs": 90}"#);
        let manager = ConfigManager::new(file.path().to_str().unwrap()).unwrap();
        let queue = manager.get_config().queue_config();

        assert_eq!(queue.batch_threshold, 5);
        assert_eq!(queue.release_window, Some(Duration::from_secs(90)));
        assert_eq!(queue.check_period, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_unknown_format() {
        let file = write_config(".toml", "check_period_secs = 30\n");
        assert!(ConfigManager::new(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_rejects_zero_period() {
        let file = write_config(".yaml", "check_period_secs: 0\n");
        assert!(ConfigManager::new(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(create_default_config().validate().is_ok());

        let mut config = create_default_config();
        config.metrics.listen_address = "not an address".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = create_default_config();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
