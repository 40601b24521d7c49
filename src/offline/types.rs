//! 离线同步层的基础类型
//!
//! 实体类型、实体 ID（服务器 ID / 临时 ID）、HTTP 方法、操作类型，
//! 以及 REST 路径拼接与 JSON 中临时 ID 的扫描/替换工具。

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 临时 ID 前缀
pub const TEMP_ID_PREFIX: &str = "temp_";

/// 离线创建实体时由客户端生成的临时 ID，格式 `temp_<毫秒时间戳>_<随机数字>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TemporaryId(String);

impl TemporaryId {
    /// 生成新的临时 ID
    pub fn generate() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let random = Uuid::new_v4().as_u128() % 1_000_000_000;
        Self(format!("{}{}_{}", TEMP_ID_PREFIX, millis, random))
    }

    /// 解析字符串，不符合格式时返回 None
    pub fn parse(s: &str) -> Option<Self> {
        if Self::is_temporary(s) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    /// 判断字符串是否为合法的临时 ID
    pub fn is_temporary(s: &str) -> bool {
        let Some(rest) = s.strip_prefix(TEMP_ID_PREFIX) else {
            return false;
        };
        let mut parts = rest.splitn(2, '_');
        match (parts.next(), parts.next()) {
            (Some(ts), Some(rand)) => is_digits(ts) && is_digits(rand),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

impl TryFrom<String> for TemporaryId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if Self::is_temporary(&value) {
            Ok(Self(value))
        } else {
            Err(format!("不是合法的临时 ID: {}", value))
        }
    }
}

impl From<TemporaryId> for String {
    fn from(id: TemporaryId) -> Self {
        id.0
    }
}

impl fmt::Display for TemporaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 实体 ID：服务器分配的整数 ID，或尚未确认的临时 ID
///
/// JSON 中服务器 ID 为数字，临时 ID 为字符串；其他字符串视为非法。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Server(i64),
    Temporary(TemporaryId),
}

impl EntityId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, EntityId::Temporary(_))
    }

    pub fn as_temporary(&self) -> Option<&TemporaryId> {
        match self {
            EntityId::Temporary(t) => Some(t),
            EntityId::Server(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            EntityId::Server(id) => Value::from(*id),
            EntityId::Temporary(t) => Value::String(t.as_str().to_string()),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Server(id) => write!(f, "{}", id),
            EntityId::Temporary(t) => write!(f, "{}", t),
        }
    }
}

impl FromStr for EntityId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(t) = TemporaryId::parse(s) {
            return Ok(EntityId::Temporary(t));
        }
        s.parse::<i64>()
            .map(EntityId::Server)
            .map_err(|_| anyhow!("无效的实体 ID: {}", s))
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Server(id)
    }
}

impl From<TemporaryId> for EntityId {
    fn from(id: TemporaryId) -> Self {
        EntityId::Temporary(id)
    }
}

/// 离线缓存的实体类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Trips,
    DiaryEntries,
    Places,
    Expenses,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Trips,
        EntityType::DiaryEntries,
        EntityType::Places,
        EntityType::Expenses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Trips => "trips",
            EntityType::DiaryEntries => "diary_entries",
            EntityType::Places => "places",
            EntityType::Expenses => "expenses",
        }
    }

    /// 子实体指向所属行程的外键字段名；行程本身没有父实体
    pub fn parent_field(&self) -> Option<&'static str> {
        match self {
            EntityType::Trips => None,
            _ => Some("trip_id"),
        }
    }

    /// 列表查询 / 创建使用的集合路径（相对 `/api`）
    pub fn collection_endpoint(&self, parent: Option<&EntityId>) -> Result<String> {
        match (self, parent) {
            (EntityType::Trips, _) => Ok("/trips".to_string()),
            (EntityType::DiaryEntries, Some(trip)) => Ok(format!("/diary/{}", trip)),
            (EntityType::Places, Some(trip)) => Ok(format!("/places/{}/places", trip)),
            (EntityType::Expenses, Some(trip)) => Ok(format!("/budget/{}/expenses", trip)),
            (other, None) => Err(anyhow!("{} 的集合路径需要所属行程 ID", other)),
        }
    }

    /// 单个实体的路径（GET/PUT/DELETE）
    pub fn item_endpoint(&self, id: &EntityId) -> String {
        match self {
            EntityType::Trips => format!("/trips/{}", id),
            EntityType::DiaryEntries => format!("/diary/{}", id),
            EntityType::Places => format!("/places/places/{}", id),
            EntityType::Expenses => format!("/budget/expenses/{}", id),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trips" | "trip" => Ok(EntityType::Trips),
            "diary_entries" | "diary" => Ok(EntityType::DiaryEntries),
            "places" | "place" => Ok(EntityType::Places),
            "expenses" | "budget" => Ok(EntityType::Expenses),
            other => Err(anyhow!("未知的实体类型: {}", other)),
        }
    }
}

/// 回放时使用的 HTTP 方法
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(anyhow!("不支持的 HTTP 方法: {}", other)),
        }
    }
}

/// 排队变更的类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    pub fn method(&self) -> HttpMethod {
        match self {
            OperationType::Create => HttpMethod::Post,
            OperationType::Update => HttpMethod::Put,
            OperationType::Delete => HttpMethod::Delete,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            other => Err(anyhow!("未知的操作类型: {}", other)),
        }
    }
}

/// 是否为 ID 或外键字段（`id`、`trip_id`、`photo_ids` 等）
fn is_reference_key(key: &str) -> bool {
    key == "id" || key.ends_with("_id") || key.ends_with("_ids")
}

/// 收集 JSON 中 ID / 外键字段里出现的临时 ID（去重，保持出现顺序）
///
/// 标题、备注等自由文本字段不参与扫描。
pub fn collect_temporary_ids(value: &Value, out: &mut Vec<TemporaryId>) {
    collect_references(value, false, out);
}

fn collect_references(value: &Value, is_reference: bool, out: &mut Vec<TemporaryId>) {
    match value {
        Value::String(s) if is_reference => {
            if let Some(t) = TemporaryId::parse(s) {
                if !out.contains(&t) {
                    out.push(t);
                }
            }
        }
        Value::Array(items) => items
            .iter()
            .for_each(|v| collect_references(v, is_reference, out)),
        Value::Object(map) => map
            .iter()
            .for_each(|(k, v)| collect_references(v, is_reference_key(k), out)),
        _ => {}
    }
}

/// 收集路径段中出现的临时 ID
pub fn endpoint_temporary_ids(endpoint: &str) -> Vec<TemporaryId> {
    endpoint
        .split('/')
        .filter_map(TemporaryId::parse)
        .collect()
}

/// 将 ID / 外键字段中等于 `temp` 的字符串替换为服务器 ID，返回是否发生替换
pub fn replace_temporary_id(value: &mut Value, temp: &TemporaryId, server_id: i64) -> bool {
    replace_references(value, false, temp, server_id)
}

fn replace_references(value: &mut Value, is_reference: bool, temp: &TemporaryId, server_id: i64) -> bool {
    match value {
        Value::String(s) if is_reference && s == temp.as_str() => {
            *value = Value::from(server_id);
            true
        }
        Value::Array(items) => items.iter_mut().fold(false, |acc, v| {
            replace_references(v, is_reference, temp, server_id) || acc
        }),
        Value::Object(map) => map.iter_mut().fold(false, |acc, (k, v)| {
            replace_references(v, is_reference_key(k), temp, server_id) || acc
        }),
        _ => false,
    }
}

/// 将路径中等于 `temp` 的段替换为服务器 ID
pub fn replace_in_endpoint(endpoint: &str, temp: &TemporaryId, server_id: i64) -> String {
    endpoint
        .split('/')
        .map(|seg| {
            if seg == temp.as_str() {
                server_id.to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
