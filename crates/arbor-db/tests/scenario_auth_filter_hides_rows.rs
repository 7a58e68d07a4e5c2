//! Authorization filters narrow reads and searches; mismatches are
//! reported as not-found, never forbidden.
//!
//! Skips when DATABASE_URL is not set.

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use arbor_db::assistants::{self, PutAssistant, SearchAssistants};
use arbor_db::{AllowAll, AuthContext, AuthDecision, StoreError};

/// Context scoping every operation to one tenant's metadata.
struct Tenant(&'static str);

#[async_trait]
impl AuthContext for Tenant {
    async fn handle(&self, _event: &str, _payload: &Value) -> arbor_db::error::Result<AuthDecision> {
        Ok(AuthDecision {
            filter: Some(json!({"tenant": self.0})),
            mutable: Some(json!({"tenant": self.0})),
        })
    }
}

async fn db_pool() -> Option<sqlx::PgPool> {
    let url = match std::env::var(arbor_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: DATABASE_URL not set");
            return None;
        }
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("connect to test database");
    arbor_db::migrate(&pool).await.expect("migrate");
    Some(pool)
}

#[tokio::test]
async fn foreign_tenant_reads_are_not_found() -> anyhow::Result<()> {
    let Some(pool) = db_pool().await else {
        return Ok(());
    };
    let id = Uuid::new_v4();
    let marker = Uuid::new_v4().to_string();

    // Created through tenant A: the mutable override stamps the metadata.
    let created = assistants::put(
        &pool,
        &Tenant("tenant-a"),
        id,
        PutAssistant {
            graph_id: "agent".to_string(),
            name: format!("auth-{marker}"),
            metadata: json!({"marker": marker}),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(created.metadata["tenant"], "tenant-a");

    // Tenant A can read it back; tenant B gets a 404-shaped error.
    assistants::get(&pool, &Tenant("tenant-a"), id).await?;
    let err = assistants::get(&pool, &Tenant("tenant-b"), id)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)), "got {err}");

    // Search through tenant B never surfaces the row.
    let (found, total) = assistants::search(
        &pool,
        &Tenant("tenant-b"),
        SearchAssistants {
            name: Some(format!("auth-{marker}")),
            ..Default::default()
        },
    )
    .await?;
    assert!(found.is_empty());
    assert_eq!(total, 0);

    // Deleting through the wrong tenant is equally invisible.
    let err = assistants::delete(&pool, &Tenant("tenant-b"), id)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    assistants::delete(&pool, &AllowAll, id).await?;
    Ok(())
}
