//! 离线缓存的实体记录定义
//!
//! 每种实体一个显式结构体，写入本地存储前先解码校验；
//! 接口返回但这里未声明的字段保存在 `extra` 中，不会丢失。

use crate::offline::types::{EntityId, EntityType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// 反序列化数组字段，处理 null 值
pub(crate) fn deserialize_vec_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_expense_category() -> String {
    "other".to_string()
}

/// 可离线缓存的记录
pub trait OfflineRecord:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &EntityId;

    /// 记录自带的所属行程 ID（接口响应不一定返回）
    fn parent_id(&self) -> Option<&EntityId> {
        None
    }

    /// 结构之外的业务约束校验
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// 将 JSON 载荷解码为记录并校验；失败时返回原因
pub fn decode_record<R: OfflineRecord>(payload: &Value) -> Result<R, String> {
    let record: R = serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
    record.validate()?;
    Ok(record)
}

/// 按实体类型校验载荷，返回其中的实体 ID
pub fn validate_payload(entity_type: EntityType, payload: &Value) -> Result<EntityId, String> {
    match entity_type {
        EntityType::Trips => decode_record::<Trip>(payload).map(|r| r.id),
        EntityType::DiaryEntries => decode_record::<DiaryEntry>(payload).map(|r| r.id),
        EntityType::Places => decode_record::<Place>(payload).map(|r| r.id),
        EntityType::Expenses => decode_record::<Expense>(payload).map(|r| r.id),
    }
}

fn check_rating(rating: Option<u8>) -> Result<(), String> {
    match rating {
        Some(r) if !(1..=5).contains(&r) => Err(format!("rating 必须在 1-5 之间，实际为 {}", r)),
        _ => Ok(()),
    }
}

fn check_coordinates(lat: Option<f64>, lon: Option<f64>) -> Result<(), String> {
    if let Some(lat) = lat {
        if !(-90.0..=90.0).contains(&lat) {
            return Err(format!("latitude 超出范围: {}", lat));
        }
    }
    if let Some(lon) = lon {
        if !(-180.0..=180.0).contains(&lon) {
            return Err(format!("longitude 超出范围: {}", lon));
        }
    }
    Ok(())
}

/// 行程
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: EntityId,
    pub title: String,
    pub destination: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub interests: Vec<String>,
    #[serde(default)]
    pub budget: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OfflineRecord for Trip {
    const ENTITY_TYPE: EntityType = EntityType::Trips;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title 不能为空".into());
        }
        check_coordinates(self.latitude, self.longitude)
    }
}

/// 旅行日记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub id: EntityId,
    #[serde(default)]
    pub trip_id: Option<EntityId>,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub entry_date: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub photos: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OfflineRecord for DiaryEntry {
    const ENTITY_TYPE: EntityType = EntityType::DiaryEntries;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn parent_id(&self) -> Option<&EntityId> {
        self.trip_id.as_ref()
    }

    fn validate(&self) -> Result<(), String> {
        check_rating(self.rating)?;
        check_coordinates(self.latitude, self.longitude)
    }
}

/// 行程中的地点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: EntityId,
    #[serde(default)]
    pub trip_id: Option<EntityId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub visited: bool,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "deserialize_vec_or_null")]
    pub photos: Vec<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OfflineRecord for Place {
    const ENTITY_TYPE: EntityType = EntityType::Places;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn parent_id(&self) -> Option<&EntityId> {
        self.trip_id.as_ref()
    }

    fn validate(&self) -> Result<(), String> {
        check_rating(self.rating)?;
        check_coordinates(Some(self.latitude), Some(self.longitude))
    }
}

/// 预算支出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: EntityId,
    #[serde(default)]
    pub trip_id: Option<EntityId>,
    pub title: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_expense_category")]
    pub category: String,
    pub date: String,
    #[serde(default)]
    pub paid_by: Option<i64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OfflineRecord for Expense {
    const ENTITY_TYPE: EntityType = EntityType::Expenses;

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn parent_id(&self) -> Option<&EntityId> {
        self.trip_id.as_ref()
    }

    fn validate(&self) -> Result<(), String> {
        if !self.amount.is_finite() {
            return Err("amount 必须是有限数值".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trip_keeps_unknown_fields() {
        let payload = json!({
            "id": 1,
            "title": "Sommer in Portugal",
            "destination": "Lissabon",
            "interests": null,
            "owner_id": 5,
            "created_at": "2024-06-01T10:00:00"
        });
        let trip: Trip = decode_record(&payload).unwrap();
        assert_eq!(trip.id, EntityId::Server(1));
        assert!(trip.interests.is_empty());
        assert_eq!(trip.currency, "EUR");
        assert_eq!(trip.extra.get("owner_id"), Some(&json!(5)));
    }

    #[test]
    fn place_without_coordinates_is_rejected() {
        let payload = json!({"id": 2, "name": "Alfama"});
        assert!(decode_record::<Place>(&payload).is_err());
    }

    #[test]
    fn out_of_range_rating_is_rejected() {
        let payload = json!({"id": 3, "title": "Tag 1", "content": "...", "rating": 7});
        let err = decode_record::<DiaryEntry>(&payload).unwrap_err();
        assert!(err.contains("rating"));
    }

    #[test]
    fn payload_validation_dispatches_by_type() {
        let payload = json!({"id": 8, "name": "Belém", "latitude": 38.69, "longitude": -9.2});
        assert_eq!(
            validate_payload(EntityType::Places, &payload),
            Ok(EntityId::Server(8))
        );
        assert!(validate_payload(EntityType::Trips, &payload).is_err());
    }

    #[test]
    fn child_record_reports_parent() {
        let payload = json!({
            "id": "temp_1700000000000_7",
            "trip_id": 4,
            "title": "Abendessen",
            "amount": 42.5,
            "date": "2024-06-02"
        });
        let expense: Expense = decode_record(&payload).unwrap();
        assert!(expense.id.is_temporary());
        assert_eq!(expense.parent_id(), Some(&EntityId::Server(4)));
        assert_eq!(expense.category, "other");
    }
}
