//! Postgres-backed policy store.
//!
//! The `PolicyStore` trait is synchronous because the engine calls it from
//! blocking pool threads. Each call drives the async sqlx query to completion
//! on the runtime captured at construction, so it must never be called from a
//! runtime worker thread.
//!
//! ## Schema
//!
//! | Table | Key |
//! |-------|-----|
//! | `policy_tuples` | `(domain, subject, resource, action)` |
//! | `grouping_tuples` | `(domain, member, role)` |
//!
//! `ensure_schema` creates both tables if they are missing.

use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use warden_core::{Effect, GroupingKind, GroupingTuple, PolicyKey, PolicyTuple, RoleId, TenantId};
use warden_policy::{PolicyStore, StoreError, StoredPolicies};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS policy_tuples (
    domain      TEXT NOT NULL,
    subject     TEXT NOT NULL,
    resource    TEXT NOT NULL,
    action      TEXT NOT NULL,
    effect      TEXT NOT NULL DEFAULT 'allow' CHECK (effect IN ('allow', 'deny')),
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (domain, subject, resource, action)
);
CREATE TABLE IF NOT EXISTS grouping_tuples (
    domain      TEXT NOT NULL,
    member      TEXT NOT NULL,
    role        TEXT NOT NULL,
    kind        TEXT NOT NULL DEFAULT 'user_role' CHECK (kind IN ('user_role', 'role_inheritance')),
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (domain, member, role)
);
"#;

#[derive(Debug, Clone)]
pub struct PostgresPolicyStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresPolicyStore {
    /// Must be called from within a tokio runtime.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            handle: Handle::current(),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool))
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn fetch(&self, domain: Option<&TenantId>) -> Result<StoredPolicies, StoreError> {
        let domain = domain.map(|d| d.as_str().to_string());

        let policy_rows = sqlx::query(
            r#"
            SELECT domain, subject, resource, action, effect
            FROM policy_tuples
            WHERE $1::TEXT IS NULL OR domain = $1
            ORDER BY domain, subject, resource, action
            "#,
        )
        .bind(domain.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let grouping_rows = sqlx::query(
            r#"
            SELECT domain, member, role, kind
            FROM grouping_tuples
            WHERE $1::TEXT IS NULL OR domain = $1
            ORDER BY domain, member, role
            "#,
        )
        .bind(domain.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut stored = StoredPolicies::default();
        for row in policy_rows {
            let effect: String = row.try_get("effect").map_err(map_sqlx_error)?;
            stored.policies.push(PolicyTuple {
                subject: RoleId::new(row.try_get::<String, _>("subject").map_err(map_sqlx_error)?),
                domain: TenantId::new(row.try_get::<String, _>("domain").map_err(map_sqlx_error)?),
                resource: row.try_get("resource").map_err(map_sqlx_error)?,
                action: row.try_get("action").map_err(map_sqlx_error)?,
                effect: Effect::parse(&effect)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown effect {effect:?}")))?,
            });
        }
        for row in grouping_rows {
            let kind: String = row.try_get("kind").map_err(map_sqlx_error)?;
            stored.groupings.push(GroupingTuple {
                member: row.try_get("member").map_err(map_sqlx_error)?,
                role: RoleId::new(row.try_get::<String, _>("role").map_err(map_sqlx_error)?),
                domain: TenantId::new(row.try_get::<String, _>("domain").map_err(map_sqlx_error)?),
                kind: parse_kind(&kind)?,
            });
        }
        Ok(stored)
    }

    async fn insert_policy_async(&self, tuple: &PolicyTuple) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO policy_tuples (domain, subject, resource, action, effect)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(tuple.domain.as_str())
        .bind(tuple.subject.as_str())
        .bind(&tuple.resource)
        .bind(&tuple.action)
        .bind(tuple.effect.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_policy_async(&self, key: &PolicyKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM policy_tuples WHERE domain = $1 AND subject = $2 AND resource = $3 AND action = $4",
        )
        .bind(key.domain.as_str())
        .bind(key.subject.as_str())
        .bind(&key.resource)
        .bind(&key.action)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_grouping_async(&self, tuple: &GroupingTuple) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO grouping_tuples (domain, member, role, kind)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(tuple.domain.as_str())
        .bind(&tuple.member)
        .bind(tuple.role.as_str())
        .bind(kind_str(tuple.kind))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_grouping_async(&self, member: &str, role: &RoleId, domain: &TenantId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM grouping_tuples WHERE domain = $1 AND member = $2 AND role = $3")
            .bind(domain.as_str())
            .bind(member)
            .bind(role.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn replace_role_policies_async(
        &self,
        role: &RoleId,
        domain: &TenantId,
        tuples: &[PolicyTuple],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query("DELETE FROM policy_tuples WHERE domain = $1 AND subject = $2")
            .bind(domain.as_str())
            .bind(role.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        for tuple in tuples {
            sqlx::query(
                r#"
                INSERT INTO policy_tuples (domain, subject, resource, action, effect)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(tuple.domain.as_str())
            .bind(tuple.subject.as_str())
            .bind(&tuple.resource)
            .bind(&tuple.action)
            .bind(tuple.effect.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)
    }
}

impl PolicyStore for PostgresPolicyStore {
    fn load_all(&self) -> Result<StoredPolicies, StoreError> {
        self.handle.block_on(self.fetch(None))
    }

    fn load_domain(&self, domain: &TenantId) -> Result<StoredPolicies, StoreError> {
        self.handle.block_on(self.fetch(Some(domain)))
    }

    fn insert_policy(&self, tuple: &PolicyTuple) -> Result<bool, StoreError> {
        self.handle.block_on(self.insert_policy_async(tuple))
    }

    fn delete_policy(&self, key: &PolicyKey) -> Result<bool, StoreError> {
        self.handle.block_on(self.delete_policy_async(key))
    }

    fn insert_grouping(&self, tuple: &GroupingTuple) -> Result<bool, StoreError> {
        self.handle.block_on(self.insert_grouping_async(tuple))
    }

    fn delete_grouping(&self, member: &str, role: &RoleId, domain: &TenantId) -> Result<bool, StoreError> {
        self.handle.block_on(self.delete_grouping_async(member, role, domain))
    }

    fn replace_role_policies(&self, role: &RoleId, domain: &TenantId, tuples: &[PolicyTuple]) -> Result<(), StoreError> {
        self.handle
            .block_on(self.replace_role_policies_async(role, domain, tuples))
    }
}

fn kind_str(kind: GroupingKind) -> &'static str {
    match kind {
        GroupingKind::UserRole => "user_role",
        GroupingKind::RoleInheritance => "role_inheritance",
    }
}

fn parse_kind(s: &str) -> Result<GroupingKind, StoreError> {
    match s {
        "user_role" => Ok(GroupingKind::UserRole),
        "role_inheritance" => Ok(GroupingKind::RoleInheritance),
        other => Err(StoreError::Corrupt(format!("unknown grouping kind {other:?}"))),
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(err.to_string())
        }
        other => StoreError::Query(other.to_string()),
    }
}
