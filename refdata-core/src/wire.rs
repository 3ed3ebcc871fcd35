//! JSON wire codec for payloads that cross process boundaries
//!
//! Field names are camelCase, enums SCREAMING_SNAKE_CASE, timestamps RFC 3339.
//! Unknown fields are ignored so older readers accept newer payloads.

use crate::{InvalidationEvent, RefdataResult, UpdateCommand, ValidationError};

pub fn encode_command(command: &UpdateCommand) -> RefdataResult<String> {
    serde_json::to_string(command).map_err(|e| {
        ValidationError::MalformedPayload {
            reason: format!("encode UpdateCommand: {}", e),
        }
        .into()
    })
}

pub fn decode_command(payload: &str) -> RefdataResult<UpdateCommand> {
    serde_json::from_str(payload).map_err(|e| {
        ValidationError::MalformedPayload {
            reason: format!("decode UpdateCommand: {}", e),
        }
        .into()
    })
}

pub fn encode_invalidation(event: &InvalidationEvent) -> RefdataResult<String> {
    serde_json::to_string(event).map_err(|e| {
        ValidationError::MalformedPayload {
            reason: format!("encode InvalidationEvent: {}", e),
        }
        .into()
    })
}

pub fn decode_invalidation(payload: &str) -> RefdataResult<InvalidationEvent> {
    serde_json::from_str(payload).map_err(|e| {
        ValidationError::MalformedPayload {
            reason: format!("decode InvalidationEvent: {}", e),
        }
        .into()
    })
}
