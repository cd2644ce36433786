//! JSON bodies posted to destinations.

use serde_json::{json, Value};

use crate::{
    client::EVENT_VERSION,
    enrichment::LearningTime,
    ingest::{CompletionAttributes, EnrollmentAttributes, EventRecord},
};

fn envelope(record: &EventRecord) -> Value {
    json!({
        "event_type": record.event_type().as_str(),
        "event_version": EVENT_VERSION,
        "occurred_at": record.occurred_at.to_rfc3339(),
        "user": {
            "id": record.user_id,
            "username": record.username,
        },
        "course": {
            "course_key": record.course_id,
        },
    })
}

/// Builds a course completion body.
///
/// `learning_time` is included under `completion` only when present; there
/// is no null placeholder.
pub fn completion_payload(
    record: &EventRecord,
    attributes: &CompletionAttributes,
    learning_time: Option<LearningTime>,
) -> Value {
    let mut completion = json!({
        "percent_grade": attributes.percent_grade,
        "letter_grade": attributes.letter_grade,
        "is_passing": attributes.is_passing,
    });
    if let (Some(learning_time), Some(fields)) = (learning_time, completion.as_object_mut()) {
        fields.insert("learning_time".to_string(), learning_time.to_json());
    }

    let mut payload = envelope(record);
    if let Some(fields) = payload.as_object_mut() {
        fields.insert("completion".to_string(), completion);
    }
    payload
}

/// Builds a course enrollment body.
pub fn enrollment_payload(record: &EventRecord, attributes: &EnrollmentAttributes) -> Value {
    let mut payload = envelope(record);
    if let Some(fields) = payload.as_object_mut() {
        fields.insert(
            "enrollment".to_string(),
            json!({ "mode": attributes.mode, "is_active": attributes.is_active }),
        );
    }
    payload
}
