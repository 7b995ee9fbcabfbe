//! Envelope wire format and codec.
//!
//! Frames are newline-terminated, newline-free JSON objects. Field names are
//! camelCase on the wire (`appId`, `hasError`, `pipeName`, ...); Rust-side
//! types stay snake_case and convert at the (de)serialization boundary.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DockRpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeType {
    Handshake,
    RpcRequest,
    RpcResponse,
    RpcEvent,
    Register,
    Unregister,
}

impl EnvelopeType {
    fn as_wire(self) -> &'static str {
        match self {
            EnvelopeType::Handshake => "handshake",
            EnvelopeType::RpcRequest => "rpc-request",
            EnvelopeType::RpcResponse => "rpc-response",
            EnvelopeType::RpcEvent => "rpc-event",
            EnvelopeType::Register => "register",
            EnvelopeType::Unregister => "unregister",
        }
    }

    fn from_wire(s: &str) -> Result<Self, DockRpcError> {
        Ok(match s {
            "handshake" => EnvelopeType::Handshake,
            "rpc-request" => EnvelopeType::RpcRequest,
            "rpc-response" => EnvelopeType::RpcResponse,
            "rpc-event" => EnvelopeType::RpcEvent,
            "register" => EnvelopeType::Register,
            "unregister" => EnvelopeType::Unregister,
            other => return Err(DockRpcError::Unknown(other.to_string())),
        })
    }
}

/// An RPC outcome as carried by an `rpc-response` payload.
#[derive(Debug, Clone)]
pub enum RpcOutcome {
    Ok(Value),
    Err {
        code: i32,
        message: String,
        data: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfoWire {
    pub name: String,
    pub description: String,
    pub icon: String,
    pub pipe_name: String,
    pub functions: BTreeSet<String>,
    pub events: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

/// `RegisterMsg` payload. Immutable after send.
#[derive(Debug, Clone)]
pub struct RegisterMsg {
    pub app_id: String,
    pub info: AppInfoWire,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Handshake {
        step: u8,
    },
    RpcRequest {
        id: String,
        method: String,
        params: Vec<Value>,
    },
    RpcResponse {
        id: String,
        outcome: RpcOutcome,
    },
    RpcEvent {
        id: String,
        event: String,
        data: Value,
    },
    Register(RegisterMsg),
    Unregister {
        app_id: String,
    },
}

/// A single framed message. `kind` and `app_id` never change after
/// construction; `id` is unique within a session.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: EnvelopeType,
    pub app_id: String,
    pub id: String,
    pub timestamp: u64,
    pub payload: Payload,
}

impl Envelope {
    fn new(clock: &dyn Clock, app_id: impl Into<String>, kind: EnvelopeType, payload: Payload) -> Self {
        Envelope {
            kind,
            app_id: app_id.into(),
            id: Uuid::new_v4().to_string(),
            timestamp: clock.now_millis(),
            payload,
        }
    }

    pub fn handshake(clock: &dyn Clock, app_id: impl Into<String>, step: u8) -> Self {
        Self::new(clock, app_id, EnvelopeType::Handshake, Payload::Handshake { step })
    }

    pub fn rpc_request(
        clock: &dyn Clock,
        app_id: impl Into<String>,
        request_id: impl Into<String>,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self::new(
            clock,
            app_id,
            EnvelopeType::RpcRequest,
            Payload::RpcRequest {
                id: request_id.into(),
                method: method.into(),
                params,
            },
        )
    }

    pub fn rpc_response(
        clock: &dyn Clock,
        app_id: impl Into<String>,
        request_id: impl Into<String>,
        outcome: RpcOutcome,
    ) -> Self {
        Self::new(
            clock,
            app_id,
            EnvelopeType::RpcResponse,
            Payload::RpcResponse {
                id: request_id.into(),
                outcome,
            },
        )
    }

    pub fn rpc_event(
        clock: &dyn Clock,
        app_id: impl Into<String>,
        event: impl Into<String>,
        data: Value,
    ) -> Self {
        Self::new(
            clock,
            app_id,
            EnvelopeType::RpcEvent,
            Payload::RpcEvent {
                id: Uuid::new_v4().to_string(),
                event: event.into(),
                data,
            },
        )
    }

    pub fn register(clock: &dyn Clock, msg: RegisterMsg) -> Self {
        let app_id = msg.app_id.clone();
        Self::new(clock, app_id, EnvelopeType::Register, Payload::Register(msg))
    }

    pub fn unregister(clock: &dyn Clock, app_id: impl Into<String>) -> Self {
        let app_id = app_id.into();
        Self::new(
            clock,
            app_id.clone(),
            EnvelopeType::Unregister,
            Payload::Unregister { app_id },
        )
    }

    fn payload_value(&self) -> Value {
        match &self.payload {
            Payload::Handshake { step } => json!({ "step": step }),
            Payload::RpcRequest { id, method, params } => json!({
                "id": id,
                "method": method,
                "params": params,
            }),
            Payload::RpcResponse { id, outcome } => match outcome {
                RpcOutcome::Ok(result) => json!({
                    "id": id,
                    "hasError": false,
                    "result": result,
                }),
                RpcOutcome::Err { code, message, data } => json!({
                    "id": id,
                    "hasError": true,
                    "error": { "code": code, "message": message, "data": data },
                }),
            },
            Payload::RpcEvent { id, event, data } => json!({
                "id": id,
                "event": event,
                "data": data,
            }),
            Payload::Register(msg) => register_wire_value(msg),
            Payload::Unregister { app_id } => json!({
                "command": "unregister",
                "appId": app_id,
            }),
        }
    }

    /// Encode as the general wrapped form: `{type, appId, id, timestamp, payload}`.
    /// Deterministic field ordering for identical inputs: same envelope always
    /// serializes to the same bytes.
    pub fn encode(&self) -> String {
        let value = json!({
            "type": self.kind.as_wire(),
            "appId": self.app_id,
            "id": self.id,
            "timestamp": self.timestamp,
            "payload": self.payload_value(),
        });
        value.to_string()
    }

    /// Encode a `register` envelope flat, without the outer wrapper, matching
    /// the dock stream's registration quirk. Panics if called on a
    /// non-register envelope; callers only ever reach for this immediately
    /// after constructing one with [`Envelope::register`].
    pub fn encode_register_flat(&self) -> String {
        match &self.payload {
            Payload::Register(msg) => register_wire_value(msg).to_string(),
            _ => panic!("encode_register_flat called on a non-register envelope"),
        }
    }

    pub fn decode(line: &str) -> Result<Self, DockRpcError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| DockRpcError::BadEnvelope(format!("invalid JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| DockRpcError::BadEnvelope("envelope is not a JSON object".into()))?;

        if !obj.contains_key("type") {
            // Dock-stream wire quirk: `register`/`unregister` may arrive flat.
            if let Some(command) = obj.get("command").and_then(Value::as_str) {
                return Self::decode_flat(command, &value);
            }
            return Err(DockRpcError::BadEnvelope("missing field `type`".into()));
        }

        let kind_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| DockRpcError::BadEnvelope("field `type` is not a string".into()))?;
        let app_id = obj
            .get("appId")
            .and_then(Value::as_str)
            .ok_or_else(|| DockRpcError::BadEnvelope("missing field `appId`".into()))?
            .to_string();
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DockRpcError::BadEnvelope("missing field `id`".into()))?
            .to_string();
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_u64)
            .ok_or_else(|| DockRpcError::BadEnvelope("missing field `timestamp`".into()))?;
        let payload = obj
            .get("payload")
            .ok_or_else(|| DockRpcError::BadEnvelope("missing field `payload`".into()))?;

        let kind = EnvelopeType::from_wire(kind_str)?;
        let payload = decode_payload(kind, payload)?;

        Ok(Envelope {
            kind,
            app_id,
            id,
            timestamp,
            payload,
        })
    }

    fn decode_flat(command: &str, value: &Value) -> Result<Self, DockRpcError> {
        let app_id = value
            .get("appId")
            .and_then(Value::as_str)
            .ok_or_else(|| DockRpcError::BadEnvelope("missing field `appId`".into()))?
            .to_string();
        match command {
            "register" => {
                let info_value = value
                    .get("appInfo")
                    .ok_or_else(|| DockRpcError::BadEnvelope("missing field `appInfo`".into()))?;
                let info: AppInfoWire = serde_json::from_value(info_value.clone())?;
                Ok(Envelope {
                    kind: EnvelopeType::Register,
                    app_id: app_id.clone(),
                    id: String::new(),
                    timestamp: 0,
                    payload: Payload::Register(RegisterMsg { app_id, info }),
                })
            }
            "unregister" => Ok(Envelope {
                kind: EnvelopeType::Unregister,
                app_id: app_id.clone(),
                id: String::new(),
                timestamp: 0,
                payload: Payload::Unregister { app_id },
            }),
            other => Err(DockRpcError::BadEnvelope(format!(
                "unknown flat command `{other}`"
            ))),
        }
    }
}

fn register_wire_value(msg: &RegisterMsg) -> Value {
    json!({
        "command": "register",
        "appId": msg.app_id,
        "appInfo": serde_json::to_value(&msg.info).expect("AppInfoWire always serializes"),
    })
}

fn decode_payload(kind: EnvelopeType, payload: &Value) -> Result<Payload, DockRpcError> {
    let bad = |reason: &str| DockRpcError::BadEnvelope(format!("payload: {reason}"));
    match kind {
        EnvelopeType::Handshake => {
            let step = payload
                .get("step")
                .and_then(Value::as_u64)
                .ok_or_else(|| bad("missing field `step`"))?;
            Ok(Payload::Handshake { step: step as u8 })
        }
        EnvelopeType::RpcRequest => {
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("missing field `id`"))?
                .to_string();
            let method = payload
                .get("method")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("missing field `method`"))?
                .to_string();
            let params = payload
                .get("params")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| bad("missing field `params`"))?;
            Ok(Payload::RpcRequest { id, method, params })
        }
        EnvelopeType::RpcResponse => {
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("missing field `id`"))?
                .to_string();
            let has_error = payload
                .get("hasError")
                .and_then(Value::as_bool)
                .ok_or_else(|| bad("missing field `hasError`"))?;
            let outcome = if has_error {
                let error = payload
                    .get("error")
                    .ok_or_else(|| bad("missing field `error`"))?;
                RpcOutcome::Err {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(500) as i32,
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    data: error.get("data").cloned().unwrap_or(Value::Null),
                }
            } else {
                RpcOutcome::Ok(payload.get("result").cloned().unwrap_or(Value::Null))
            };
            Ok(Payload::RpcResponse { id, outcome })
        }
        EnvelopeType::RpcEvent => {
            let id = payload
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("missing field `id`"))?
                .to_string();
            let event = payload
                .get("event")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("missing field `event`"))?
                .to_string();
            let data = payload.get("data").cloned().unwrap_or(Value::Null);
            Ok(Payload::RpcEvent { id, event, data })
        }
        EnvelopeType::Register => {
            let app_id = payload
                .get("appId")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("missing field `appId`"))?
                .to_string();
            let info_value = payload
                .get("appInfo")
                .ok_or_else(|| bad("missing field `appInfo`"))?;
            let info: AppInfoWire = serde_json::from_value(info_value.clone())?;
            Ok(Payload::Register(RegisterMsg { app_id, info }))
        }
        EnvelopeType::Unregister => {
            let app_id = payload
                .get("appId")
                .and_then(Value::as_str)
                .ok_or_else(|| bad("missing field `appId`"))?
                .to_string();
            Ok(Payload::Unregister { app_id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn round_trips_rpc_request() {
        let clock = FakeClock::new(1);
        let env = Envelope::rpc_request(&clock, "app-1", "r1", "add", vec![json!(2), json!(3)]);
        let line = env.encode();
        assert!(!line.contains('\n'));
        let decoded = Envelope::decode(&line).unwrap();
        assert_eq!(decoded.app_id, "app-1");
        assert_eq!(decoded.id, env.id);
        assert_eq!(decoded.timestamp, env.timestamp);
        match decoded.payload {
            Payload::RpcRequest { id, method, params } => {
                assert_eq!(id, "r1");
                assert_eq!(method, "add");
                assert_eq!(params, vec![json!(2), json!(3)]);
            }
            _ => panic!("wrong payload variant"),
        }
    }

    #[test]
    fn same_input_encodes_byte_identical() {
        let clock = FakeClock::new(42);
        let env = Envelope::rpc_event(&clock, "app-1", "progress", json!({"pct": 50}));
        let mut re_id = env.clone();
        re_id.timestamp = env.timestamp;
        assert_eq!(env.encode(), re_id.encode());
    }

    #[test]
    fn rejects_missing_required_field() {
        let err = Envelope::decode(r#"{"appId":"a","id":"1","timestamp":1,"payload":{}}"#).unwrap_err();
        assert!(matches!(err, DockRpcError::BadEnvelope(_)));
    }

    #[test]
    fn unknown_type_is_surfaced_not_dropped() {
        let err = Envelope::decode(
            r#"{"type":"bogus","appId":"a","id":"1","timestamp":1,"payload":{}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DockRpcError::Unknown(ref t) if t == "bogus"));
    }

    #[test]
    fn register_round_trips_flat() {
        let clock = FakeClock::new(1);
        let mut functions = BTreeSet::new();
        functions.insert("add".to_string());
        let msg = RegisterMsg {
            app_id: "app-1".into(),
            info: AppInfoWire {
                name: "demo".into(),
                description: "a demo app".into(),
                icon: "icon.png".into(),
                pipe_name: "demo_app_pipe".into(),
                functions,
                events: BTreeSet::new(),
                http_url: None,
                local_path: None,
            },
        };
        let env = Envelope::register(&clock, msg);
        let flat = env.encode_register_flat();
        assert!(!flat.contains("\"type\""));
        let decoded = Envelope::decode(&flat).unwrap();
        match decoded.payload {
            Payload::Register(msg) => {
                assert_eq!(msg.app_id, "app-1");
                assert_eq!(msg.info.pipe_name, "demo_app_pipe");
            }
            _ => panic!("wrong payload variant"),
        }
    }
}
