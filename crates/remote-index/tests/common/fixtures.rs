//! Index message fixtures.

use chrono::{DateTime, Duration, TimeZone, Utc};

use helios_remote_index::message::{
    DateParameter, IndexMessage, ProfileParameter, ReferenceParameter, RemoteIndexMessage,
    StringParameter, TagParameter, TokenParameter,
};

/// The instant every fixture version was written, offset by `millis`.
pub fn at(millis: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 6, 1, 10, 0, 0).unwrap() + Duration::milliseconds(millis)
}

/// Builder for a Patient index message.
#[derive(Debug, Clone)]
pub struct PatientMessage {
    message: IndexMessage,
}

impl PatientMessage {
    /// A Patient version with a family name and a gender token.
    pub fn new(logical_resource_id: i64, version_id: i32, parameter_hash: &str) -> Self {
        let logical_id = format!("p{}", logical_resource_id);
        Self {
            message: IndexMessage {
                resource_type: "Patient".to_string(),
                logical_id,
                logical_resource_id,
                version_id,
                last_updated: at(version_id as i64),
                parameter_hash: parameter_hash.to_string(),
                string_values: vec![StringParameter {
                    name: "family".to_string(),
                    value: Some("Doe".to_string()),
                    composite_id: None,
                }],
                token_values: vec![TokenParameter {
                    name: "gender".to_string(),
                    value_system: Some("http://hl7.org/fhir/administrative-gender".to_string()),
                    value_code: "female".to_string(),
                    ref_version_id: None,
                    composite_id: None,
                }],
                ..Default::default()
            },
        }
    }

    pub fn with_last_updated(mut self, last_updated: DateTime<Utc>) -> Self {
        self.message.last_updated = last_updated;
        self
    }

    pub fn with_family(mut self, family: &str) -> Self {
        self.message.string_values[0].value = Some(family.to_string());
        self
    }

    pub fn with_birth_date(mut self, start: DateTime<Utc>) -> Self {
        self.message.date_values.push(DateParameter {
            name: "birthdate".to_string(),
            value_date_start: Some(start),
            value_date_end: Some(start + Duration::days(1) - Duration::milliseconds(1)),
            composite_id: None,
        });
        self
    }

    pub fn with_token(mut self, name: &str, system: Option<&str>, code: &str) -> Self {
        self.message.token_values.push(TokenParameter {
            name: name.to_string(),
            value_system: system.map(str::to_string),
            value_code: code.to_string(),
            ref_version_id: None,
            composite_id: None,
        });
        self
    }

    pub fn with_tag(mut self, system: &str, code: &str) -> Self {
        self.message.tag_values.push(TagParameter {
            name: "_tag".to_string(),
            value_system: Some(system.to_string()),
            value_code: code.to_string(),
        });
        self
    }

    pub fn with_profile(mut self, url: &str) -> Self {
        self.message.profile_values.push(ProfileParameter {
            name: "_profile".to_string(),
            url: url.to_string(),
            profile_version: None,
            fragment: None,
        });
        self
    }

    pub fn with_reference(mut self, name: &str, resource_type: &str, logical_id: &str) -> Self {
        self.message.ref_values.push(ReferenceParameter {
            name: name.to_string(),
            ref_resource_type: resource_type.to_string(),
            ref_logical_id: logical_id.to_string(),
            ref_version_id: None,
            composite_id: None,
        });
        self
    }

    pub fn build(self) -> IndexMessage {
        self.message
    }

    /// The message wrapped in an envelope and serialized.
    pub fn payload(self) -> String {
        envelope(self.message, None)
    }
}

/// Serializes a message envelope, optionally stamped with an instance id.
pub fn envelope(message: IndexMessage, instance_identifier: Option<&str>) -> String {
    let mut envelope = RemoteIndexMessage::new(message);
    envelope.instance_identifier = instance_identifier.map(str::to_string);
    envelope.to_json().expect("Failed to serialize index message")
}
