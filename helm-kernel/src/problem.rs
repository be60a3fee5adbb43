//! RFC 7807 Problem Details wire contract (`spec.md` §6, §7) and the
//! sanitization boundary: internal errors are logged in full via `tracing`
//! but only a title/code/trace_id ever crosses the response boundary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Stable error code from the `codes`/`shared_codes` tables of the
    /// component crates (e.g. `RECEIPT_CHAIN_BROKEN`, `ERR_APPROVAL_EXPIRED`).
    pub code: String,
}

impl ProblemDetails {
    pub fn new(problem_type: impl Into<String>, title: impl Into<String>, status: u16, code: impl Into<String>) -> Self {
        Self {
            problem_type: problem_type.into(),
            title: title.into(),
            status,
            detail: None,
            instance: None,
            trace_id: None,
            code: code.into(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Log `error` in full at `error` level with a fresh trace id, and return
/// only the sanitized subset that is safe to put on the wire. Callers never
/// construct a [`ProblemDetails`] directly from a caught error's `Display`
/// output — this is the one place that boundary is crossed.
pub fn sanitize(code: &str, title: &str, status: u16, internal_detail: &str) -> ProblemDetails {
    let trace_id = Uuid::new_v4().to_string();
    tracing::error!(code, trace_id = %trace_id, detail = internal_detail, "request failed");
    ProblemDetails::new("about:blank", title, status, code).with_trace_id(trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_drops_internal_detail_from_wire_value() {
        let problem = sanitize("RECEIPT_CHAIN_BROKEN", "receipt chain broken", 409, "db row mismatch at offset 44");
        let json = serde_json::to_string(&problem).unwrap();
        assert!(!json.contains("db row mismatch"));
        assert!(json.contains("RECEIPT_CHAIN_BROKEN"));
        assert!(problem.trace_id.is_some());
    }
}
