use berth_instance::InstanceId;

/// Failure taxonomy surfaced to the API layer. Backend-level failures are
/// translated into these at the controller boundary; the raw detail lands in
/// the instance's own log buffer first.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("unknown instance: {0}")]
    NotFound(InstanceId),

    #[error("instance already running: {0}")]
    AlreadyRunning(InstanceId),

    #[error("instance not running: {0}")]
    NotRunning(InstanceId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("failed to start instance {id}: {detail}")]
    StartFailed { id: InstanceId, detail: String },

    #[error("graceful stop of instance {id} exceeded {grace_ms}ms; process was killed")]
    StopTimeout { id: InstanceId, grace_ms: u64 },

    #[error("instance {id} is externally managed: {detail}")]
    ExternallyManaged { id: InstanceId, detail: String },

    #[error("port {port} unavailable: {detail}")]
    PortUnavailable { port: u16, detail: String },

    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    /// Stable machine-readable kind, independent of message wording.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyRunning(_) => "already_running",
            Self::NotRunning(_) => "not_running",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::StartFailed { .. } => "start_failed",
            Self::StopTimeout { .. } => "stop_timeout",
            Self::ExternallyManaged { .. } => "externally_managed",
            Self::PortUnavailable { .. } => "port_unavailable",
            Self::Persistence(_) => "persistence",
            Self::Io(_) => "io",
        }
    }
}

/// Flatten an anyhow chain into a single line for log buffers, dropping
/// empty and repeated causes.
pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_stable() {
        let id = InstanceId("a".into());
        assert_eq!(LifecycleError::NotFound(id.clone()).kind(), "not_found");
        assert_eq!(
            LifecycleError::StartFailed {
                id,
                detail: "boom".into()
            }
            .kind(),
            "start_failed"
        );
    }

    #[test]
    fn chain_is_flattened_without_duplicates() {
        let err = anyhow::anyhow!("root cause")
            .context("root cause")
            .context("spawn redis-server");
        assert_eq!(format_error_chain(&err), "spawn redis-server: root cause");
    }
}
