//! JMRI JSON envelopes.
//!
//! Every message on the socket is `{"type": ..., "data": {...}, "method": ...}`
//! with `data` and `method` optional. List replies may arrive as a JSON
//! array of envelopes.
//!
//! ```rust
//! use rs_knobcab::jmri_json::{Envelope, PowerData};
//! use rs_knobcab::PowerState;
//!
//! let env = Envelope::set_power("main", true);
//! assert_eq!(env.to_json().unwrap(), r#"{"type":"power","data":{"name":"main","state":2}}"#);
//!
//! let parsed = Envelope::parse_frame(r#"{"type":"power","data":{"name":"main","state":4}}"#).unwrap();
//! let power = PowerData::from_envelope(&parsed[0]).unwrap();
//! assert_eq!(power.power_state(), PowerState::Off);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::PowerState;
use crate::error::{Error, Result};

/// JMRI numeric power state for on.
pub const JMRI_POWER_ON: i64 = 2;
/// JMRI numeric power state for off.
pub const JMRI_POWER_OFF: i64 = 4;

/// Message type strings used by this client.
pub mod kind {
    /// Track power.
    pub const POWER: &str = "power";
    /// Server greeting.
    pub const HELLO: &str = "hello";
    /// Heartbeat request.
    pub const PING: &str = "ping";
    /// Heartbeat reply.
    pub const PONG: &str = "pong";
    /// Server-side error report.
    pub const ERROR: &str = "error";
}

/// One JSON message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Request method (`get`, `list`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl Envelope {
    /// Envelope with only a type.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            method: None,
        }
    }

    /// Sets the payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// `{"type":"ping","data":{}}`
    pub fn ping() -> Self {
        Self::new(kind::PING).with_data(json!({}))
    }

    /// `{"type":"power","data":{"name":..},"method":"get"}`, which also
    /// subscribes to later changes.
    pub fn get_power(name: &str) -> Self {
        Self::new(kind::POWER)
            .with_data(json!({ "name": name }))
            .with_method("get")
    }

    /// `{"type":"power","method":"list"}`
    pub fn list_power() -> Self {
        Self::new(kind::POWER).with_method("list")
    }

    /// `{"type":"power","data":{"name":..,"state":2|4}}`
    pub fn set_power(name: &str, on: bool) -> Self {
        let state = if on { JMRI_POWER_ON } else { JMRI_POWER_OFF };
        Self::new(kind::POWER).with_data(json!({ "name": name, "state": state }))
    }

    /// Serializes to a compact JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses one WebSocket text frame into its envelopes.
    ///
    /// A frame is either a single object or an array of objects.
    pub fn parse_frame(text: &str) -> Result<Vec<Envelope>> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(Error::from))
                .collect(),
            Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
            other => Err(Error::Malformed(format!("unexpected JSON frame: {other}"))),
        }
    }
}

/// Payload of a `power` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerData {
    /// Power manager name.
    pub name: String,
    /// JMRI numeric state (0 unknown, 2 on, 4 off).
    #[serde(default)]
    pub state: i64,
    /// Whether this manager is the server's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
}

impl PowerData {
    /// Extracts power data from an envelope's payload.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let data = envelope
            .data
            .as_ref()
            .ok_or_else(|| Error::Malformed("power message without data".into()))?;
        let power: PowerData = serde_json::from_value(data.clone())?;
        if power.name.is_empty() {
            return Err(Error::Malformed("power message without name".into()));
        }
        Ok(power)
    }

    /// Maps the JMRI numeric state.
    pub fn power_state(&self) -> PowerState {
        match self.state {
            JMRI_POWER_ON => PowerState::On,
            JMRI_POWER_OFF => PowerState::Off,
            _ => PowerState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_shapes() {
        assert_eq!(Envelope::ping().to_json().unwrap(), r#"{"type":"ping","data":{}}"#);
        assert_eq!(
            Envelope::list_power().to_json().unwrap(),
            r#"{"type":"power","method":"list"}"#
        );
        assert_eq!(
            Envelope::get_power("DCC++").to_json().unwrap(),
            r#"{"type":"power","data":{"name":"DCC++"},"method":"get"}"#
        );
        assert_eq!(
            Envelope::set_power("main", false).to_json().unwrap(),
            r#"{"type":"power","data":{"name":"main","state":4}}"#
        );
    }

    #[test]
    fn test_parse_array_frame() {
        let frame = r#"[{"type":"power","data":{"name":"A","state":2,"default":true}},
                        {"type":"power","data":{"name":"B","state":0}}]"#;
        let envs = Envelope::parse_frame(frame).unwrap();
        assert_eq!(envs.len(), 2);
        let b = PowerData::from_envelope(&envs[1]).unwrap();
        assert_eq!(b.name, "B");
        assert_eq!(b.power_state(), PowerState::Unknown);
        assert_eq!(PowerData::from_envelope(&envs[0]).unwrap().default, Some(true));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Envelope::parse_frame("not json").is_err());
        assert!(Envelope::parse_frame("42").is_err());
        assert!(Envelope::parse_frame(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_power_data_requires_name() {
        let env = Envelope::new("power").with_data(json!({ "state": 2 }));
        assert!(PowerData::from_envelope(&env).is_err());
        assert!(PowerData::from_envelope(&Envelope::new("power")).is_err());
    }
}
