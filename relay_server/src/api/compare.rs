//! `/ping` 与 `/compare` 端点。
//!
//! `/compare` 分别测量一次 HTTP `/ping` 往返和一次 RPC ping 往返的耗时。
//! WebSocket 的耗时只能由浏览器端测量，因此响应中的 `websocket` 字段恒为占位字符串。

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use common_models::CompareReport;
use log::{debug, warn};

use super::rpc_ping;
use crate::state::AppState;

/// `websocket` 字段的占位内容。
pub const WEBSOCKET_PLACEHOLDER: &str = "use client for WS timing";

/// 单次探测的超时时间。
pub const COMPARE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// 两种带外协议的往返计时器。
#[derive(Debug, Clone)]
pub struct CompareService {
    http: reqwest::Client,
    rest_url: String,
    rpc_addr: String,
    timeout: Duration,
}

impl CompareService {
    pub fn new(
        rest_url: impl Into<String>,
        rpc_addr: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            rest_url: rest_url.into(),
            rpc_addr: rpc_addr.into(),
            timeout,
        })
    }

    pub async fn measure_rest(&self) -> Result<Duration, String> {
        let start = Instant::now();
        let response = self
            .http
            .get(&self.rest_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?;
        let body = response.text().await.map_err(|e| e.to_string())?;
        let elapsed = start.elapsed();
        if body.trim() != "pong" {
            return Err(format!("unexpected response: {}", body));
        }
        Ok(elapsed)
    }

    pub async fn measure_rpc(&self) -> Result<Duration, String> {
        let start = Instant::now();
        rpc_ping::ping(&self.rpc_addr, self.timeout)
            .await
            .map_err(|e| e.to_string())?;
        Ok(start.elapsed())
    }

    pub async fn report(&self) -> CompareReport {
        let rest = self.measure_rest().await;
        let grpc = self.measure_rpc().await;
        if let Err(e) = &rest {
            warn!("[比较端点] REST ping 失败: {}", e);
        }
        if let Err(e) = &grpc {
            warn!("[比较端点] RPC ping 失败: {}", e);
        }
        CompareReport {
            rest: format_measurement(rest),
            grpc: format_measurement(grpc),
            websocket: WEBSOCKET_PLACEHOLDER.to_string(),
        }
    }
}

fn format_measurement(measurement: Result<Duration, String>) -> String {
    match measurement {
        Ok(elapsed) => format!("{}ms", elapsed.as_millis()),
        Err(e) => format!("Error: {}", e),
    }
}

pub async fn ping_handler() -> &'static str {
    "pong"
}

pub async fn compare_handler(State(state): State<Arc<AppState>>) -> Json<CompareReport> {
    let report = state.compare.report().await;
    debug!("[比较端点] {:?}", report);
    Json(report)
}
