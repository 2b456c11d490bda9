use super::model::{now_unix, ApiKey};
use crate::error::Result;
use sqlx::{Row, SqlitePool};

fn decode(row: sqlx::sqlite::SqliteRow) -> ApiKey {
    let scopes: String = row.try_get("scopes").unwrap_or_default();
    ApiKey {
        hash: row.try_get("hash").unwrap_or_default(),
        public_prefix: row.try_get("public_prefix").unwrap_or_default(),
        scopes: scopes.split(',').filter(|s| !s.is_empty()).map(String::from).collect(),
        expires_at: row.try_get("expires_at").unwrap_or_default(),
        revoked_at: row.try_get("revoked_at").unwrap_or_default(),
        last_used_at: row.try_get("last_used_at").unwrap_or_default(),
        created_at: row.try_get("created_at").unwrap_or_default(),
    }
}

/// Inserts a new API key row. `hash` is the SHA-256 hex digest of the
/// secret; the secret itself is never stored.
pub async fn create(
    pool: &SqlitePool,
    hash: &str,
    public_prefix: &str,
    scopes: &[String],
    expires_at: Option<i64>,
) -> Result<ApiKey> {
    let now = now_unix();
    let scopes_col = scopes.join(",");
    sqlx::query(
        r#"
        INSERT INTO api_keys (hash, public_prefix, scopes, expires_at, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(hash)
    .bind(public_prefix)
    .bind(&scopes_col)
    .bind(expires_at)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(ApiKey {
        hash: hash.to_string(),
        public_prefix: public_prefix.to_string(),
        scopes: scopes.to_vec(),
        expires_at,
        revoked_at: None,
        last_used_at: None,
        created_at: now,
    })
}

/// Looks up a key by its exact hash. Callers must hash the presented
/// secret first — never compare secrets directly against stored values.
pub async fn get_by_hash(pool: &SqlitePool, hash: &str) -> Result<Option<ApiKey>> {
    let row = sqlx::query("SELECT * FROM api_keys WHERE hash = ?")
        .bind(hash)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(decode))
}

/// Best-effort touch of `last_used_at`. Failures here must never block the
/// request the key authenticated.
pub async fn touch_last_used(pool: &SqlitePool, hash: &str) {
    let _ = sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE hash = ?")
        .bind(now_unix())
        .bind(hash)
        .execute(pool)
        .await;
}

pub async fn revoke(pool: &SqlitePool, hash: &str) -> Result<()> {
    sqlx::query("UPDATE api_keys SET revoked_at = ? WHERE hash = ?")
        .bind(now_unix())
        .bind(hash)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn test_store() -> Store {
        Store::open(std::path::Path::new(":memory:")).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_lookup_by_hash() {
        let store = test_store().await;
        create(store.pool(), "deadbeef", "hf_abc", &["machines:read".into()], None)
            .await
            .unwrap();

        let key = get_by_hash(store.pool(), "deadbeef").await.unwrap().unwrap();
        assert!(key.has_scope("machines:read"));
        assert!(!key.has_scope("machines:delete"));
        assert!(key.is_valid(now_unix()));
    }

    #[tokio::test]
    async fn revoked_key_is_invalid() {
        let store = test_store().await;
        create(store.pool(), "k2", "hf_def", &["*".into()], None).await.unwrap();
        revoke(store.pool(), "k2").await.unwrap();

        let key = get_by_hash(store.pool(), "k2").await.unwrap().unwrap();
        assert!(!key.is_valid(now_unix()));
    }
}
