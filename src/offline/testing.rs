//! 单元测试共用的内存 API

use crate::offline::api::{ApiError, RemoteApi};
use crate::offline::types::HttpMethod;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// 记录调用顺序的远端 API
///
/// POST 返回请求体并分配自增 ID（预置了响应时原样返回）；PUT 返回请求体并带上路径中的 ID；
/// DELETE 无响应体；GET 返回通过 `serve` 预置的数据，未预置时返回 404。
pub(crate) struct MockRemoteApi {
    calls: Mutex<Vec<(HttpMethod, String, Option<Value>)>>,
    next_id: AtomicI64,
    failures: Mutex<HashMap<String, ApiError>>,
    responses: Mutex<HashMap<String, Value>>,
    unreachable: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockRemoteApi {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(100),
            failures: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    pub(crate) fn fail(&self, endpoint: &str, error: ApiError) {
        self.failures.lock().unwrap().insert(endpoint.to_string(), error);
    }

    pub(crate) fn heal(&self, endpoint: &str) {
        self.failures.lock().unwrap().remove(endpoint);
    }

    pub(crate) fn serve(&self, endpoint: &str, body: Value) {
        self.responses.lock().unwrap().insert(endpoint.to_string(), body);
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn calls(&self) -> Vec<(HttpMethod, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(m, e, _)| (*m, e.clone()))
            .collect()
    }

    pub(crate) fn bodies(&self) -> Vec<Option<Value>> {
        self.calls.lock().unwrap().iter().map(|(_, _, b)| b.clone()).collect()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn with_id(body: Option<&Value>, id: Value) -> Value {
    let mut map = body
        .and_then(|b| b.as_object().cloned())
        .unwrap_or_else(Map::new);
    map.insert("id".to_string(), id);
    Value::Object(map)
}

#[async_trait]
impl RemoteApi for MockRemoteApi {
    async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, ApiError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.calls
            .lock()
            .unwrap()
            .push((method, endpoint.to_string(), body.cloned()));

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ApiError::Network("connection refused".into()));
        }
        if let Some(err) = self.failures.lock().unwrap().get(endpoint) {
            return Err(err.clone());
        }

        match method {
            HttpMethod::Get => self
                .responses
                .lock()
                .unwrap()
                .get(endpoint)
                .cloned()
                .map(Some)
                .ok_or_else(|| ApiError::from_status(404, "not found")),
            HttpMethod::Post => {
                if let Some(scripted) = self.responses.lock().unwrap().get(endpoint).cloned() {
                    return Ok(Some(scripted));
                }
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                Ok(Some(with_id(body, Value::from(id))))
            }
            HttpMethod::Put => {
                let id = endpoint
                    .rsplit('/')
                    .next()
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(Value::from)
                    .unwrap_or(Value::Null);
                Ok(Some(with_id(body, id)))
            }
            HttpMethod::Delete => Ok(None),
        }
    }
}
