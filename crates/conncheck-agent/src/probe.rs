//! 探测执行模块
//!
//! 对目标地址执行一次 TCP 连接（单独记录域名解析耗时），连接成功后尝试一次
//! 不校验证书的 TLS 握手。检查的目的是可达性而非信任校验，许多合法目标也不是
//! TLS 端点，因此握手失败按 TCP 成功处理。

use chrono::{DateTime, Utc};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, ServerName};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsConnector;
use tracing::debug;

use conncheck_common::split_host_port;

use crate::certs::ClientCertificate;

/// 探测错误分类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// 域名解析失败
    #[error("failed to resolve host {host}: {reason}")]
    Dns { host: String, reason: String },

    /// TCP 连接失败（拒绝、超时、不可达等）
    #[error("{0}")]
    TcpConnect(String),
}

/// 探测各阶段的耗时记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyTrace {
    /// 域名解析开始时间，目标为 IP 地址时为空
    pub dns_start: Option<DateTime<Utc>>,
    /// 域名解析耗时
    pub dns_duration: Duration,
    /// TCP 连接开始时间
    pub connect_start: DateTime<Utc>,
    /// TCP 连接耗时
    pub connect_duration: Duration,
}

/// 一次探测的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub trace: LatencyTrace,
    pub error: Option<ProbeError>,
}

/// 探测执行器，每次调用互不影响
#[derive(Debug, Clone)]
pub struct ProbeExecutor {
    timeout: Duration,
}

impl ProbeExecutor {
    /// 创建探测执行器，`timeout` 限制整个探测（解析、连接与握手）
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// 对目标地址执行一次探测
    pub async fn probe(&self, address: &str, certificates: &[ClientCertificate]) -> ProbeOutcome {
        let deadline = Instant::now() + self.timeout;
        let mut trace = LatencyTrace {
            dns_start: None,
            dns_duration: Duration::ZERO,
            connect_start: Utc::now(),
            connect_duration: Duration::ZERO,
        };

        let (host, port) = match split_host_port(address) {
            Ok(parts) => parts,
            Err(e) => {
                return ProbeOutcome {
                    trace,
                    error: Some(ProbeError::TcpConnect(format!("dial tcp {}: {}", address, e))),
                }
            }
        };

        let addrs = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => {
                let dns_start = Utc::now();
                let started = Instant::now();
                let resolved = timeout_at(deadline, lookup_host((host.as_str(), port))).await;
                trace.dns_start = Some(dns_start);
                trace.dns_duration = started.elapsed();

                let resolved = match resolved {
                    Ok(Ok(addrs)) => {
                        let addrs: Vec<SocketAddr> = addrs.collect();
                        if addrs.is_empty() {
                            Err("no such host".to_string())
                        } else {
                            debug!("解析 {} 得到 {:?}", host, addrs);
                            Ok(addrs)
                        }
                    }
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("i/o timeout".to_string()),
                };

                match resolved {
                    Ok(addrs) => addrs,
                    Err(reason) => {
                        trace.connect_start = dns_start;
                        return ProbeOutcome {
                            trace,
                            error: Some(ProbeError::Dns {
                                host: host.clone(),
                                reason,
                            }),
                        };
                    }
                }
            }
        };

        trace.connect_start = Utc::now();
        let started = Instant::now();
        let connected = connect_any(&addrs, deadline).await;
        trace.connect_duration = started.elapsed();

        let stream = match connected {
            Ok(stream) => stream,
            Err(reason) => {
                return ProbeOutcome {
                    trace,
                    error: Some(ProbeError::TcpConnect(reason)),
                }
            }
        };

        match timeout_at(deadline, tls_handshake(stream, &host, certificates)).await {
            Ok(Ok(())) => debug!("{} TLS 握手成功", address),
            Ok(Err(e)) => debug!("{} TLS 握手失败（按 TCP 成功处理）: {}", address, e),
            Err(_) => debug!("{} TLS 握手超时（按 TCP 成功处理）", address),
        }

        ProbeOutcome { trace, error: None }
    }
}

/// 依次尝试解析到的地址，返回第一个成功的连接
async fn connect_any(addrs: &[SocketAddr], deadline: Instant) -> Result<TcpStream, String> {
    let mut last_error = String::from("no addresses to dial");
    for addr in addrs {
        match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_error = format!("dial tcp {}: {}", addr, e),
            Err(_) => return Err(format!("dial tcp {}: i/o timeout", addr)),
        }
    }
    Err(last_error)
}

/// 不校验服务端证书的验证器
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

async fn tls_handshake(
    stream: TcpStream,
    host: &str,
    certificates: &[ClientCertificate],
) -> anyhow::Result<()> {
    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));
    let config = match certificates.first() {
        Some(cert) => builder.with_client_auth_cert(cert.cert_chain.clone(), cert.key.clone())?,
        None => builder.with_no_client_auth(),
    };

    let server_name = ServerName::try_from(host)?;
    let connector = TlsConnector::from(Arc::new(config));
    connector.connect(server_name, stream).await?;
    Ok(())
}
