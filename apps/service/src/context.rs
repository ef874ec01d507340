//! Per-request attribute bag shared by the pipeline, services, and facades.

/// Carried through every operation: the correlation id for logs, audit
/// records, and envelopes, plus the dry-run flag.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub request_id: String,
    pub dry_run: bool,
}

impl OpContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            dry_run: false,
        }
    }

    pub fn dry_run(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            dry_run: true,
        }
    }
}
