//! 指标收集与导出模块
//!
//! 记录每次探测的结果计数与各阶段耗时，并通过 Prometheus 格式导出。
//! 同一 HTTP 服务同时提供 `/healthz` 存活探针。

use anyhow::{Context, Result};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use conncheck_common::CheckTarget;

use crate::probe::{ProbeError, ProbeOutcome};

const CHECK_COUNT: &str = "pod_network_connectivity_check_count";
const DNS_LATENCY: &str = "pod_network_connectivity_check_dns_latency_seconds";
const TCP_LATENCY: &str = "pod_network_connectivity_check_tcp_connect_latency_seconds";

/// 探测结果分类，用作指标标签
fn result_label(outcome: &ProbeOutcome) -> &'static str {
    match outcome.error {
        None => "success",
        Some(ProbeError::Dns { .. }) => "dns_error",
        Some(ProbeError::TcpConnect(_)) => "tcp_connect_error",
    }
}

/// 连通性检查指标
pub struct CheckMetrics {
    registry: Registry,
    check_count: IntCounterVec,
    dns_latency: GaugeVec,
    tcp_latency: GaugeVec,
    server_addr: OnceCell<SocketAddr>,
}

impl CheckMetrics {
    /// 创建指标并注册到独立的注册表
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let check_count = IntCounterVec::new(
            Opts::new(CHECK_COUNT, "Number of connectivity checks by result"),
            &["check", "target", "result"],
        )?;
        let dns_latency = GaugeVec::new(
            Opts::new(DNS_LATENCY, "DNS resolution latency of the latest check"),
            &["check", "target"],
        )?;
        let tcp_latency = GaugeVec::new(
            Opts::new(TCP_LATENCY, "TCP connect latency of the latest check"),
            &["check", "target"],
        )?;

        registry.register(Box::new(check_count.clone()))?;
        registry.register(Box::new(dns_latency.clone()))?;
        registry.register(Box::new(tcp_latency.clone()))?;

        Ok(Self {
            registry,
            check_count,
            dns_latency,
            tcp_latency,
            server_addr: OnceCell::new(),
        })
    }

    /// 记录一次探测结果
    pub fn observe(&self, target: &CheckTarget, outcome: &ProbeOutcome) {
        let labels = [target.name.as_str(), target.target_endpoint.as_str()];
        self.check_count
            .with_label_values(&[labels[0], labels[1], result_label(outcome)])
            .inc();

        if outcome.trace.dns_start.is_some() {
            self.dns_latency
                .with_label_values(&labels)
                .set(outcome.trace.dns_duration.as_secs_f64());
        }
        if !matches!(outcome.error, Some(ProbeError::Dns { .. })) {
            self.tcp_latency
                .with_label_values(&labels)
                .set(outcome.trace.connect_duration.as_secs_f64());
        }
    }

    /// 删除某个检查的全部指标
    pub fn forget(&self, target: &CheckTarget) {
        let labels = [target.name.as_str(), target.target_endpoint.as_str()];
        for result in ["success", "dns_error", "tcp_connect_error"] {
            let _ = self
                .check_count
                .remove_label_values(&[labels[0], labels[1], result]);
        }
        let _ = self.dns_latency.remove_label_values(&labels);
        let _ = self.tcp_latency.remove_label_values(&labels);
    }

    /// 以文本格式导出当前指标
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("编码指标失败")?;
        Ok(buffer)
    }

    /// 启动指标服务器，返回实际监听的地址
    ///
    /// 每个实例只能启动一次。
    pub fn start_metrics_server(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        if let Some(existing) = self.server_addr.get() {
            anyhow::bail!("指标服务器已在 {} 运行", existing);
        }

        let builder = Server::try_bind(&addr).context(format!("无法监听 {}", addr))?;
        let metrics = self.clone();
        let make_svc = make_service_fn(move |_| {
            let metrics = metrics.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let metrics = metrics.clone();
                    async move { Ok::<_, Infallible>(metrics.route(&req)) }
                }))
            }
        });

        let server = builder.serve(make_svc);
        let local_addr = server.local_addr();
        let _ = self.server_addr.set(local_addr);
        info!("指标服务器启动在 {}", local_addr);

        tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("指标服务器错误: {}", e);
            }
        });

        Ok(local_addr)
    }

    fn route(&self, req: &Request<Body>) -> Response<Body> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/metrics") => match self.render() {
                Ok(buffer) => {
                    let mut response = Response::new(Body::from(buffer));
                    if let Ok(value) = prometheus::TEXT_FORMAT.parse() {
                        response
                            .headers_mut()
                            .insert(hyper::header::CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => {
                    error!("导出指标失败: {:#}", e);
                    status_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                }
            },
            (&Method::GET, "/healthz") => status_response(StatusCode::OK, "ok"),
            _ => status_response(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn status_response(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
