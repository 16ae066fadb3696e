//! 远端状态读写
//!
//! 通过 status 子资源读写 `PodNetworkConnectivityCheck` 的状态。写回时携带读取时的
//! resourceVersion，由 API Server 做乐观并发校验。

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::Resource;
use serde_json::json;

use conncheck_agent::client::{StatusClient, StatusSnapshot};
use conncheck_common::{Error, Result};

use crate::crd::PodNetworkConnectivityCheck;

/// 把 kube 错误映射为统一错误类型
pub fn map_kube_error(name: &str, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(response) if response.code == 409 => {
            Error::Conflict(format!("{}: {}", name, response.message))
        }
        kube::Error::Api(response) if response.code == 404 => {
            Error::NotFound(format!("{}: {}", name, response.message))
        }
        kube::Error::Api(response) => Error::Api(format!(
            "{}: {} ({})",
            name, response.message, response.code
        )),
        kube::Error::SerdeError(e) => Error::Serialization(format!("{}: {}", name, e)),
        other => Error::Network(format!("{}: {}", name, other)),
    }
}

/// 基于 kube Api 的状态访问
#[derive(Clone)]
pub struct KubeStatusClient {
    api: Api<PodNetworkConnectivityCheck>,
}

impl KubeStatusClient {
    pub fn new(api: Api<PodNetworkConnectivityCheck>) -> Self {
        Self { api }
    }
}

/// 构造 status 子资源的请求体
fn status_body(name: &str, snapshot: &StatusSnapshot) -> serde_json::Value {
    json!({
        "apiVersion": PodNetworkConnectivityCheck::api_version(&()),
        "kind": PodNetworkConnectivityCheck::kind(&()),
        "metadata": {
            "name": name,
            "resourceVersion": snapshot.resource_version,
        },
        "status": snapshot.status,
    })
}

#[async_trait]
impl StatusClient for KubeStatusClient {
    async fn get_status(&self, name: &str) -> Result<StatusSnapshot> {
        let check = self
            .api
            .get_status(name)
            .await
            .map_err(|e| map_kube_error(name, e))?;

        Ok(StatusSnapshot {
            resource_version: check.metadata.resource_version,
            status: check.status.unwrap_or_default(),
        })
    }

    async fn update_status(&self, name: &str, snapshot: StatusSnapshot) -> Result<StatusSnapshot> {
        let body = serde_json::to_vec(&status_body(name, &snapshot))?;
        let check = self
            .api
            .replace_status(name, &PostParams::default(), body)
            .await
            .map_err(|e| map_kube_error(name, e))?;

        Ok(StatusSnapshot {
            resource_version: check.metadata.resource_version,
            status: check.status.unwrap_or_default(),
        })
    }
}
