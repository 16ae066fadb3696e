//! 检查目标描述
//!
//! 由外部的列举/监听机制提供，描述一个待监测的目标端点。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// 待监测的目标
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTarget {
    /// 检查名称
    pub name: String,
    /// 发起检查的源 Pod
    pub source_pod: String,
    /// 目标地址（host:port）
    pub target_endpoint: String,
    /// 客户端证书所在 Secret 的名称
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_client_cert: Option<String>,
}

impl fmt::Display for CheckTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.name, self.target_endpoint)
    }
}

/// 拆分 `host:port`，支持 `[v6addr]:port` 形式
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("目标地址缺少端口: {}", address)))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || (host.contains(':') && !address.starts_with('[')) {
        return Err(Error::Config(format!("无效的目标地址: {}", address)));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("无效的端口: {}", address)))?;

    Ok((host.to_string(), port))
}
