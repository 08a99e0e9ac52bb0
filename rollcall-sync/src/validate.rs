//! Envelope validation.
//!
//! Turns a parsed JSON value into a [`ClientMessage`] or a [`ValidationError`].
//! Nothing in here panics or closes connections: the hub logs the error and
//! keeps the session alive so that an old or buggy client cannot take itself
//! offline with one bad message.

use serde_json::Value;
use thiserror::Error;

use crate::model::{AttendanceRecord, Payload, PayloadMode, PublicSettings, Roster};
use crate::protocol::{ClientMessage, MessageType};

pub const EMPLOYEE_ID_MAX_CHARS: usize = 100;
pub const NAME_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no string `type`")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("`{0}` requires a `data` payload")]
    MissingData(MessageType),
    #[error("`{kind}` payload has the wrong shape: {detail}")]
    Shape { kind: MessageType, detail: String },
    #[error("record {index}: `{field}` {problem}")]
    Field {
        index: usize,
        field: &'static str,
        problem: &'static str,
    },
    #[error("payload is {got:?} but this hub expects {expected:?}")]
    ModeMismatch {
        expected: PayloadMode,
        got: PayloadMode,
    },
}

/// Validates envelopes for one deployment's payload mode.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    mode: PayloadMode,
}

impl Validator {
    pub fn new(mode: PayloadMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> PayloadMode {
        self.mode
    }

    pub fn validate(&self, envelope: Value) -> Result<ClientMessage, ValidationError> {
        let Value::Object(mut map) = envelope else {
            return Err(ValidationError::NotAnObject);
        };
        let kind = match map.get("type") {
            Some(Value::String(s)) => {
                MessageType::parse(s).ok_or_else(|| ValidationError::UnknownType(s.clone()))?
            }
            _ => return Err(ValidationError::MissingType),
        };

        let data = match map.remove("data") {
            Some(Value::Null) | None if kind.carries_data() => {
                return Err(ValidationError::MissingData(kind));
            }
            other => other,
        };

        match kind {
            MessageType::Load => Ok(ClientMessage::Load),
            MessageType::LoadSettings => Ok(ClientMessage::LoadSettings),
            MessageType::Save => {
                let payload: Payload<Roster> = decode_payload(kind, data)?;
                self.check_mode(payload.mode())?;
                if let Payload::Plain(roster) = &payload {
                    validate_roster(roster)?;
                }
                Ok(ClientMessage::Save(payload))
            }
            MessageType::SaveSettings => {
                let payload: Payload<PublicSettings> = decode_payload(kind, data)?;
                self.check_mode(payload.mode())?;
                Ok(ClientMessage::SaveSettings(payload))
            }
        }
    }

    fn check_mode(&self, got: PayloadMode) -> Result<(), ValidationError> {
        if got == self.mode {
            Ok(())
        } else {
            Err(ValidationError::ModeMismatch {
                expected: self.mode,
                got,
            })
        }
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    kind: MessageType,
    data: Option<Value>,
) -> Result<Payload<T>, ValidationError> {
    let data = data.ok_or(ValidationError::MissingData(kind))?;
    serde_json::from_value(data).map_err(|e| ValidationError::Shape {
        kind,
        detail: e.to_string(),
    })
}

/// Check every record. One bad record rejects the whole roster.
pub fn validate_roster(roster: &[AttendanceRecord]) -> Result<(), ValidationError> {
    roster
        .iter()
        .enumerate()
        .try_for_each(|(index, rec)| validate_record(index, rec))
}

fn validate_record(index: usize, rec: &AttendanceRecord) -> Result<(), ValidationError> {
    check_bounded(index, "employeeId", &rec.employee_id, EMPLOYEE_ID_MAX_CHARS)?;
    check_bounded(index, "name", &rec.name, NAME_MAX_CHARS)
}

fn check_bounded(
    index: usize,
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Field { index, field, problem: "is empty" });
    }
    if value.chars().count() > max {
        return Err(ValidationError::Field { index, field, problem: "is too long" });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plain() -> Validator {
        Validator::new(PayloadMode::Plain)
    }

    #[test]
    fn test_load_requests() {
        assert_eq!(plain().validate(json!({"type": "load"})), Ok(ClientMessage::Load));
        // Stray data on a load is ignored
        assert_eq!(
            plain().validate(json!({"type": "loadSettings", "data": 5})),
            Ok(ClientMessage::LoadSettings)
        );
    }

    #[test]
    fn test_save_plain_roster() {
        let msg = plain()
            .validate(json!({
                "type": "save",
                "data": [{"employeeId": "E1", "name": "Alice", "attending": true,
                          "checkedAt": "2024-01-01T09:05:00Z", "kana": null}]
            }))
            .unwrap();
        let ClientMessage::Save(Payload::Plain(roster)) = msg else {
            panic!("expected plain save");
        };
        assert_eq!(roster[0].employee_id, "E1");
        assert!(roster[0].attending);
    }

    #[test]
    fn test_duplicate_ids_accepted() {
        let rec = json!({"employeeId": "E1", "name": "Alice", "attending": false});
        let msg = plain().validate(json!({"type": "save", "data": [rec.clone(), rec]}));
        assert!(msg.is_ok());
    }

    #[test]
    fn test_unknown_and_missing_type() {
        assert_eq!(
            plain().validate(json!({"type": "drop"})),
            Err(ValidationError::UnknownType("drop".into()))
        );
        assert_eq!(plain().validate(json!({"data": []})), Err(ValidationError::MissingType));
        assert_eq!(plain().validate(json!({"type": 3})), Err(ValidationError::MissingType));
        assert_eq!(plain().validate(json!([1, 2])), Err(ValidationError::NotAnObject));
    }

    #[test]
    fn test_save_requires_data() {
        assert_eq!(
            plain().validate(json!({"type": "save"})),
            Err(ValidationError::MissingData(MessageType::Save))
        );
        assert_eq!(
            plain().validate(json!({"type": "saveSettings", "data": null})),
            Err(ValidationError::MissingData(MessageType::SaveSettings))
        );
    }

    #[test]
    fn test_bad_record_rejects_whole_save() {
        let err = plain()
            .validate(json!({"type": "save", "data": [
                {"employeeId": "E1", "name": "Alice", "attending": true},
                {"employeeId": "", "name": "Bob", "attending": false}
            ]}))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::Field { index: 1, field: "employeeId", problem: "is empty" }
        );
    }

    #[test]
    fn test_field_length_bounds() {
        let long_name = "名".repeat(NAME_MAX_CHARS);
        assert!(plain()
            .validate(json!({"type": "save", "data": [
                {"employeeId": "E1", "name": long_name, "attending": true}
            ]}))
            .is_ok());

        let too_long = "x".repeat(EMPLOYEE_ID_MAX_CHARS + 1);
        let err = plain()
            .validate(json!({"type": "save", "data": [
                {"employeeId": too_long, "name": "A", "attending": true}
            ]}))
            .unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "employeeId", .. }));
    }

    #[test]
    fn test_wrong_types_are_shape_errors() {
        let err = plain()
            .validate(json!({"type": "save", "data": [
                {"employeeId": "E1", "name": "Alice", "attending": "yes"}
            ]}))
            .unwrap_err();
        assert!(matches!(err, ValidationError::Shape { kind: MessageType::Save, .. }));

        let err = plain()
            .validate(json!({"type": "saveSettings", "data": {"showList": 1}}))
            .unwrap_err();
        assert!(matches!(err, ValidationError::Shape { .. }));
    }

    #[test]
    fn test_mode_mismatch() {
        assert_eq!(
            plain().validate(json!({"type": "save", "data": "c2VhbGVk"})),
            Err(ValidationError::ModeMismatch {
                expected: PayloadMode::Plain,
                got: PayloadMode::Sealed
            })
        );

        let sealed = Validator::new(PayloadMode::Sealed);
        assert!(sealed.validate(json!({"type": "save", "data": "c2VhbGVk"})).is_ok());
        assert!(sealed.validate(json!({"type": "save", "data": []})).is_err());
        assert!(sealed
            .validate(json!({"type": "saveSettings", "data": {"showList": true}}))
            .is_err());
    }

    #[test]
    fn test_save_settings_plain() {
        let msg = plain()
            .validate(json!({"type": "saveSettings",
                             "data": {"showList": true, "publicColumns": {"name": true}}}))
            .unwrap();
        let ClientMessage::SaveSettings(Payload::Plain(settings)) = msg else {
            panic!("expected plain settings");
        };
        assert!(settings.show_list);
        assert!(settings.is_column_public("name"));
    }
}
