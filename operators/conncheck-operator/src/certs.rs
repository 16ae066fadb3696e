//! 从 Secret 读取客户端证书

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;

use conncheck_agent::certs::{CertificateSource, ClientCertificate};
use conncheck_common::{Error, Result};

use crate::status::map_kube_error;

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// 解析 kubernetes.io/tls 格式的 Secret
pub fn certificate_from_secret(secret: &Secret) -> Result<ClientCertificate> {
    let data = secret.data.as_ref();
    let field = |key: &str| {
        data.and_then(|d| d.get(key))
            .map(|value| value.0.as_slice())
            .ok_or_else(|| {
                Error::Certificate(format!(
                    "Secret {} 缺少 {}",
                    secret.metadata.name.as_deref().unwrap_or_default(),
                    key
                ))
            })
    };

    ClientCertificate::from_pem(field(TLS_CERT_KEY)?, field(TLS_PRIVATE_KEY_KEY)?)
}

/// 按检查对象引用的 Secret 提供客户端证书
#[derive(Clone)]
pub struct SecretCertificateSource {
    api: Api<Secret>,
    secret_name: Option<String>,
}

impl SecretCertificateSource {
    pub fn new(api: Api<Secret>, secret_name: Option<String>) -> Self {
        Self { api, secret_name }
    }
}

#[async_trait]
impl CertificateSource for SecretCertificateSource {
    async fn client_certificates(&self) -> Result<Vec<ClientCertificate>> {
        let name = match &self.secret_name {
            Some(name) => name,
            None => return Ok(Vec::new()),
        };

        let secret = self
            .api
            .get(name)
            .await
            .map_err(|e| map_kube_error(name, e))?;
        Ok(vec![certificate_from_secret(&secret)?])
    }
}
