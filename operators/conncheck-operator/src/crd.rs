//! 自定义资源定义模块
//!
//! `PodNetworkConnectivityCheck` 描述一条从源 Pod 到目标地址的连通性检查，
//! 状态部分由本 Operator 中运行的连接监控维护。

use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

use conncheck_common::{CheckTarget, ConnectivityCheckStatus};

/// 连通性检查规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[kube(
    group = "controlplane.operator.openshift.io",
    version = "v1alpha1",
    kind = "PodNetworkConnectivityCheck",
    namespaced,
    schema = "disabled"
)]
#[kube(status = "ConnectivityCheckStatus")]
#[serde(rename_all = "camelCase")]
pub struct PodNetworkConnectivityCheckSpec {
    /// 执行检查的源 Pod 名称
    pub source_pod: String,

    /// 目标地址，格式为 host:port
    pub target_endpoint: String,

    /// TLS 握手时使用的客户端证书所在的 Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_client_cert: Option<SecretReference>,
}

/// 同命名空间内的 Secret 引用
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,
}

impl PodNetworkConnectivityCheck {
    /// 转换为连接监控使用的检查目标
    pub fn to_target(&self) -> CheckTarget {
        CheckTarget {
            name: self.name_any(),
            source_pod: self.spec.source_pod.clone(),
            target_endpoint: self.spec.target_endpoint.clone(),
            tls_client_cert: self.spec.tls_client_cert.as_ref().map(|s| s.name.clone()),
        }
    }
}
