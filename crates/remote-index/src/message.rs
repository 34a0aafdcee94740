//! Inbound index messages.
//!
//! The FHIR server publishes one message per committed resource version. The
//! envelope carries the producing instance and a message format version; the
//! payload carries the version metadata used by the readiness check and the
//! extracted search parameter values.
//!
//! ```json
//! {
//!   "messageVersion": 1,
//!   "instanceIdentifier": "fhir-server-1",
//!   "data": {
//!     "resourceType": "Patient",
//!     "logicalId": "patient-1",
//!     "logicalResourceId": 42,
//!     "versionId": 3,
//!     "lastUpdated": "2022-06-01T10:00:00Z",
//!     "parameterHash": "abc",
//!     "stringValues": [{ "name": "family", "value": "Doe" }]
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// The message format version this service understands.
pub const MESSAGE_VERSION: i32 = 1;

/// Code system used for tokens published without a system.
pub const DEFAULT_TOKEN_SYSTEM: &str = "default-token-system";

/// Message envelope as published on the topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIndexMessage {
    pub message_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub data: IndexMessage,
}

impl RemoteIndexMessage {
    pub fn new(data: IndexMessage) -> Self {
        Self {
            message_version: MESSAGE_VERSION,
            instance_identifier: None,
            tenant_id: None,
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Search parameters extracted from one resource version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMessage {
    pub resource_type: String,
    pub logical_id: String,
    pub logical_resource_id: i64,
    pub version_id: i32,
    pub last_updated: DateTime<Utc>,
    /// Routing value for the sharded layout; defaults to `resourceType/logicalId`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_shard: Option<String>,
    pub parameter_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub string_values: Vec<StringParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub number_values: Vec<NumberParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub date_values: Vec<DateParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quantity_values: Vec<QuantityParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub location_values: Vec<LocationParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_values: Vec<TokenParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_values: Vec<TagParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profile_values: Vec<ProfileParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_values: Vec<TagParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ref_values: Vec<ReferenceParameter>,
}

impl IndexMessage {
    /// Total number of parameter values carried.
    pub fn parameter_count(&self) -> usize {
        self.string_values.len()
            + self.number_values.len()
            + self.date_values.len()
            + self.quantity_values.len()
            + self.location_values.len()
            + self.token_values.len()
            + self.tag_values.len()
            + self.profile_values.len()
            + self.security_values.len()
            + self.ref_values.len()
    }

    /// Value the shard key is derived from.
    pub fn routing_value(&self) -> String {
        match &self.request_shard {
            Some(shard) => shard.clone(),
            None => format!("{}/{}", self.resource_type, self.logical_id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringParameter {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberParameter {
    pub name: String,
    #[serde(default)]
    pub value: Option<Decimal>,
    #[serde(default)]
    pub value_low: Option<Decimal>,
    #[serde(default)]
    pub value_high: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateParameter {
    pub name: String,
    #[serde(default)]
    pub value_date_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub value_date_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityParameter {
    pub name: String,
    #[serde(default)]
    pub value_number: Option<Decimal>,
    #[serde(default)]
    pub value_number_low: Option<Decimal>,
    #[serde(default)]
    pub value_number_high: Option<Decimal>,
    #[serde(default)]
    pub value_system: Option<String>,
    #[serde(default)]
    pub value_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationParameter {
    pub name: String,
    #[serde(default)]
    pub value_latitude: Option<f64>,
    #[serde(default)]
    pub value_longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenParameter {
    pub name: String,
    #[serde(default)]
    pub value_system: Option<String>,
    pub value_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_version_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

/// A coded value: used for both `_tag` and `_security`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagParameter {
    pub name: String,
    #[serde(default)]
    pub value_system: Option<String>,
    pub value_code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileParameter {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub profile_version: Option<String>,
    #[serde(default)]
    pub fragment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceParameter {
    pub name: String,
    pub ref_resource_type: String,
    pub ref_logical_id: String,
    #[serde(default)]
    pub ref_version_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

/// Decodes a payload and checks its format version.
pub fn parse_message(payload: &str) -> Result<RemoteIndexMessage, MessageError> {
    let message: RemoteIndexMessage = serde_json::from_str(payload)?;
    if message.message_version != MESSAGE_VERSION {
        return Err(MessageError::UnsupportedVersion {
            found: message.message_version,
            supported: MESSAGE_VERSION,
        });
    }
    Ok(message)
}
