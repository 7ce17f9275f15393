//! Welcome payload parsing
//!
//! The first frame on every physical connection carries the machine's
//! capabilities as a JSON string in `tool_result.system`. Any other frame's
//! `system` field either is absent or fails to parse here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::MachineIdField;

/// Capabilities of the remote machine, known after the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMetadata {
    pub display_width: u32,
    pub display_height: u32,
    pub display_num: Option<u32>,
    pub arch: Option<String>,
    pub machine_id: Option<String>,
    /// Short-lived token, never logged
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
}

/// Parse a welcome payload, returning `None` for anything that is not one
///
/// Width and height are required; every other field tolerates null or absence.
pub fn parse_metadata(system: &str, id_field: MachineIdField) -> Option<MachineMetadata> {
    let value: Value = serde_json::from_str(system).ok()?;
    let object = value.as_object()?;

    let display_width = dimension(object, "display_width")?;
    let display_height = dimension(object, "display_height")?;

    let hostname = text(object, "hostname");
    let machine_id = text(object, "machine_id");
    let machine_id = match id_field {
        MachineIdField::Hostname => hostname,
        MachineIdField::MachineId => machine_id,
        MachineIdField::Any => machine_id.or(hostname),
    };

    Some(MachineMetadata {
        display_width,
        display_height,
        display_num: dimension(object, "display_num"),
        arch: text(object, "arch"),
        machine_id,
        access_token: text(object, "access_token"),
    })
}

// Integers sometimes arrive as strings ("1024") from older images
fn dimension(object: &Map<String, Value>, key: &str) -> Option<u32> {
    match object.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
