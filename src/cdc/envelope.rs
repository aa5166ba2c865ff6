// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Table-change envelope decoder.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;

use super::{prepare_payload, ChangeRecord, DecodeError, Operation, SourceInfo};
use crate::org_unit::OrgUnitImage;

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    op: String,
    #[serde(default)]
    before: Option<OrgUnitImage>,
    #[serde(default)]
    after: Option<OrgUnitImage>,
    #[serde(default)]
    source: Option<SourceInfo>,
    #[serde(default)]
    ts_ms: Option<i64>,
}

/// Decodes raw CDC envelopes for one configured default tenant.
#[derive(Debug, Clone)]
pub struct EnvelopeDecoder {
    default_tenant: String,
}

impl EnvelopeDecoder {
    pub fn new(default_tenant: impl Into<String>) -> Self {
        Self {
            default_tenant: default_tenant.into(),
        }
    }

    #[must_use]
    pub fn default_tenant(&self) -> &str {
        &self.default_tenant
    }

    /// Decode one raw (possibly compressed) envelope.
    pub fn decode(&self, raw: &[u8]) -> Result<ChangeRecord, DecodeError> {
        let payload = prepare_payload(raw)?;
        let mut value: Value = serde_json::from_slice(&payload)?;

        // Schema-carrying converters wrap the envelope in {"schema":..,"payload":..}
        if value.get("op").is_none() {
            if let Some(inner) = value.get_mut("payload").map(Value::take) {
                value = inner;
            }
        }

        let envelope: RawEnvelope = serde_json::from_value(value)?;
        let operation = Operation::from_code(&envelope.op)
            .ok_or_else(|| DecodeError::UnknownOperation(envelope.op.clone()))?;

        let source_timestamp = envelope
            .ts_ms
            .or_else(|| envelope.source.as_ref().and_then(|s| s.ts_ms))
            .and_then(DateTime::from_timestamp_millis);

        Ok(
            ChangeRecord::new(operation, envelope.before, envelope.after, &self.default_tenant)?
                .with_source_timestamp(source_timestamp)
                .with_source(envelope.source),
        )
    }
}
