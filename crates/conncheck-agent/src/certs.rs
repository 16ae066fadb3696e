//! 客户端证书模块
//!
//! 探测时进行的 TLS 握手可携带客户端证书。证书来源由外部提供，
//! 例如从 Kubernetes Secret 中读取的 PEM 数据。

use async_trait::async_trait;
use rustls::{Certificate, PrivateKey};
use rustls_pemfile::Item;
use std::io::BufReader;

use conncheck_common::{Error, Result};

/// TLS 客户端证书
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    /// 证书链（叶子证书在前）
    pub cert_chain: Vec<Certificate>,
    /// 私钥
    pub key: PrivateKey,
}

impl ClientCertificate {
    /// 从 PEM 格式的证书与私钥解析
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_chain: Vec<Certificate> = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .map_err(|e| Error::Certificate(format!("解析证书失败: {}", e)))?
            .into_iter()
            .map(Certificate)
            .collect();
        if cert_chain.is_empty() {
            return Err(Error::Certificate("PEM 数据中没有证书".to_string()));
        }

        let key = rustls_pemfile::read_all(&mut BufReader::new(key_pem))
            .map_err(|e| Error::Certificate(format!("解析私钥失败: {}", e)))?
            .into_iter()
            .find_map(|item| match item {
                Item::RSAKey(key) | Item::PKCS8Key(key) | Item::ECKey(key) => Some(PrivateKey(key)),
                _ => None,
            })
            .ok_or_else(|| Error::Certificate("PEM 数据中没有私钥".to_string()))?;

        Ok(Self { cert_chain, key })
    }
}

/// 客户端证书来源
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// 获取当前的客户端证书列表，可以为空
    async fn client_certificates(&self) -> Result<Vec<ClientCertificate>>;
}

/// 固定的证书列表
#[derive(Debug, Clone, Default)]
pub struct StaticCertificates(pub Vec<ClientCertificate>);

#[async_trait]
impl CertificateSource for StaticCertificates {
    async fn client_certificates(&self) -> Result<Vec<ClientCertificate>> {
        Ok(self.0.clone())
    }
}
