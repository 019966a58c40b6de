use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HoplineError, Result};

/// Body posted to `/process`. Every hop receives the payload of the hop
/// before it, so all fields are tolerant of absence; validation is the
/// receiving handler's job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl ChainRequest {
    pub fn require_user_fields(&self) -> Result<(i64, &str)> {
        let user_id = self
            .user_id
            .ok_or_else(|| HoplineError::InvalidRequest("user_id is required".into()))?;
        let action = self
            .action
            .as_deref()
            .ok_or_else(|| HoplineError::InvalidRequest("action is required".into()))?;
        Ok((user_id, action))
    }

    pub fn data_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(Value::as_i64)
    }

    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Ok,
    Degraded,
    Error,
}

/// Response a hop returns to its caller. `downstream` nests the next hop's
/// response so the entry service surfaces the whole chain's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainResponse {
    pub status: ChainStatus,
    pub trace_id: String,
    pub service: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream: Option<Box<ChainResponse>>,
    pub processing_time_ms: i64,
}

/// Audit row persisted once per hop. The `(trace_id, service, request_ts)`
/// triple is the idempotency key: replaying the same request produces the
/// same row, not a second one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub service: String,
    pub request_ts: DateTime<Utc>,
    pub request_json: String,
    pub response_json: String,
    pub processing_time_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_deserializes_from_sparse_body() {
        let req: ChainRequest = serde_json::from_str("{}").unwrap();
        assert!(req.user_id.is_none());
        assert!(req.service_chain.is_empty());
        assert!(req.require_user_fields().is_err());

        let req: ChainRequest =
            serde_json::from_str(r#"{"user_id": 1001, "action": "checkout"}"#).unwrap();
        let (user_id, action) = req.require_user_fields().unwrap();
        assert_eq!(user_id, 1001);
        assert_eq!(action, "checkout");
    }

    #[test]
    fn request_round_trips_enriched_payload() {
        let mut req = ChainRequest {
            user_id: Some(7),
            action: Some("checkout".into()),
            service_chain: vec!["user-service".into()],
            data: Map::new(),
        };
        req.data.insert("order_id".into(), Value::from(2042));
        let back: ChainRequest = serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.data_i64("order_id"), Some(2042));
    }

    #[test]
    fn response_omits_empty_optional_fields() {
        let resp = ChainResponse {
            status: ChainStatus::Ok,
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".into(),
            service: "audit-service".into(),
            message: "chain completed".into(),
            service_chain: Vec::new(),
            data: Map::new(),
            downstream: None,
            processing_time_ms: 3,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("downstream"));
        assert!(!json.contains("service_chain"));
        assert!(json.contains("\"status\":\"ok\""));
    }
}
