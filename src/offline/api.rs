//! TravelMind REST API 客户端
//!
//! `RemoteApi` 是同步层与服务器之间唯一的接缝：在线读写与队列回放都经由它发出请求，
//! 测试中以内存实现替换。

use crate::offline::types::HttpMethod;
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

/// 默认请求超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 远端请求失败的分类
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("网络不可用: {0}")]
    Network(String),

    #[error("请求超时")]
    Timeout,

    #[error("未授权 (401)")]
    Unauthorized,

    #[error("冲突 (409): {0}")]
    Conflict(String),

    #[error("请求被拒绝 ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("服务器错误 ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("响应解析失败: {0}")]
    Decode(String),
}

impl ApiError {
    /// 按 HTTP 状态码分类
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 => ApiError::Unauthorized,
            409 => ApiError::Conflict(body),
            400..=499 => ApiError::Rejected { status, body },
            _ => ApiError::Server { status, body },
        }
    }

    /// 连接层面的失败（没有拿到服务器响应）
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Timeout)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized => Some(401),
            ApiError::Conflict(_) => Some(409),
            ApiError::Rejected { status, .. } | ApiError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

/// 远端 REST API
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// 发送请求；2xx 且有 body 时返回 JSON，204 / 空 body 返回 None
    async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, ApiError>;
}

/// 基于 reqwest 的 API 客户端
pub struct HttpRemoteApi {
    client: reqwest::Client,
    api_base_url: String,
}

impl HttpRemoteApi {
    /// 创建新的 API 客户端
    ///
    /// `client` 应该已经在外部配置好认证头和超时
    pub fn new(client: reqwest::Client, api_base_url: String) -> Self {
        Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// 创建带 Bearer 认证头和请求超时的客户端
    pub fn with_token(api_base_url: String, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                if !token.is_empty() {
                    headers.insert(
                        reqwest::header::AUTHORIZATION,
                        reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                            .context("无效的 token")?,
                    );
                }
                headers
            })
            .timeout(timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self::new(http_client, api_base_url))
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.api_base_url, endpoint)
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, ApiError> {
        let request_id = Uuid::new_v4().to_string();
        let url = self.url(endpoint);

        info!("[Api] 📡 {} {}", method, endpoint);
        debug!("[Api]   请求URL: {}, 请求ID: {}", url, request_id);

        let mut builder = self
            .client
            .request(to_reqwest_method(method), &url)
            .header("X-Request-ID", &request_id);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            error!("[Api] {} {} 请求失败: {}", method, endpoint, e);
            ApiError::from(e)
        })?;

        let status = response.status();
        let body_bytes = response.bytes().await?;
        let body_str = String::from_utf8_lossy(&body_bytes);
        debug!("[Api] {} {} 响应 Body: {}", method, endpoint, body_str);

        if !status.is_success() {
            error!(
                "[Api] {} {} 请求失败，HTTP状态: {}, 响应: {}",
                method, endpoint, status, body_str
            );
            return Err(ApiError::from_status(status.as_u16(), body_str.into_owned()));
        }

        if status == reqwest::StatusCode::NO_CONTENT || body_bytes.is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_slice(&body_bytes).map_err(|e| {
            error!(
                "[Api] {} {} 反序列化失败: {:?}\n原始响应: {}",
                method, endpoint, e, body_str
            );
            ApiError::Decode(e.to_string())
        })?;

        Ok(Some(value))
    }
}
