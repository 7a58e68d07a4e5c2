//! Authorization seam. Every repository method hands its event name and
//! payload to an [`AuthContext`]; the returned decision narrows reads via a
//! metadata containment filter and may override mutable fields on writes.
//! A filter mismatch is reported as not-found, never forbidden.

use async_trait::async_trait;
use serde_json::Value;

use arbor_schemas::json_contains;

use crate::error::Result;

/// Outcome of an authorization check.
#[derive(Debug, Clone, Default)]
pub struct AuthDecision {
    /// Metadata containment filter; `None` means allow all.
    pub filter: Option<Value>,
    /// Metadata keys merged into the entity on create/update (e.g. an
    /// owner id), applied after the caller's own metadata.
    pub mutable: Option<Value>,
}

/// Opaque authorization hook; implementations should be stateless.
#[async_trait]
pub trait AuthContext: Send + Sync {
    /// `event` is a server-side name such as `assistants:read` or
    /// `threads:create_run`; `payload` carries the operation's parameters.
    async fn handle(&self, event: &str, payload: &Value) -> Result<AuthDecision>;
}

/// Default context: no filtering, no overrides.
pub struct AllowAll;

#[async_trait]
impl AuthContext for AllowAll {
    async fn handle(&self, _event: &str, _payload: &Value) -> Result<AuthDecision> {
        Ok(AuthDecision::default())
    }
}

/// True when `metadata` satisfies the decision's filter.
pub fn matches(metadata: &Value, filter: Option<&Value>) -> bool {
    match filter {
        None => true,
        Some(f) => json_contains(metadata, f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct OwnerScoped;

    #[async_trait]
    impl AuthContext for OwnerScoped {
        async fn handle(&self, _event: &str, _payload: &Value) -> Result<AuthDecision> {
            Ok(AuthDecision {
                filter: Some(json!({"owner": "u1"})),
                mutable: Some(json!({"owner": "u1"})),
            })
        }
    }

    #[tokio::test]
    async fn allow_all_passes_everything() {
        let decision = AllowAll.handle("assistants:read", &json!({})).await.unwrap();
        assert!(matches(&json!({"owner": "someone"}), decision.filter.as_ref()));
    }

    #[tokio::test]
    async fn scoped_filter_hides_foreign_rows() {
        let decision = OwnerScoped.handle("threads:read", &json!({})).await.unwrap();
        assert!(matches(&json!({"owner": "u1"}), decision.filter.as_ref()));
        assert!(!matches(&json!({"owner": "u2"}), decision.filter.as_ref()));
        assert!(!matches(&json!({}), decision.filter.as_ref()));
    }
}
