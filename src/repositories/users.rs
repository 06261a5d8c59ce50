use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    network::{DownlineCount, NodeFilter},
    users::{Package, SponsorChange, SponsorWrite, SponsorWriteOutcome, User, UserMatch},
};

/// Upper bound on sponsor hops followed when walking an ancestor chain.
pub const ANCESTRY_HOP_LIMIT: i32 = 10_000;

/// Advisory lock key serialising every sponsor write.
const SPONSOR_WRITE_LOCK: i64 = 0x5350_4f4e_534f_52;

const USER_COLUMNS: &str =
    "id, legacy_id, name, email, package_id, sponsor_id, created_at, updated_at";

const MISSING_REFERRAL_FILTER: &str = r#"
    sponsor_id IS NULL
    AND ($1::text IS NULL OR id <> $1)
    AND ($2::text IS NULL OR name ILIKE $2 OR email ILIKE $2 OR legacy_id ILIKE $2)
    AND (cardinality($3::text[]) = 0 OR package_id = ANY($3))
    AND ($4::date IS NULL OR created_at::date >= $4)
    AND ($5::date IS NULL OR created_at::date <= $5)
"#;

/// Data access for users and their sponsor links.
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, anyhow::Error>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, anyhow::Error>;

    async fn get_user_by_legacy_id(&self, legacy_id: &str)
        -> Result<Option<User>, anyhow::Error>;

    /// Earliest registered user without a sponsor.
    async fn get_default_root(&self) -> Result<Option<User>, anyhow::Error>;

    /// Every user whose sponsor is one of `parent_ids`.
    async fn get_children(&self, parent_ids: &[String]) -> Result<Vec<User>, anyhow::Error>;

    /// Sponsor ids above `user_id`, nearest first. Stops at an unsponsored
    /// user or after `max_hops`.
    async fn get_ancestor_ids(
        &self,
        user_id: &str,
        max_hops: i32,
    ) -> Result<Vec<String>, anyhow::Error>;

    async fn downline_counts(
        &self,
        ids: &[String],
        max_depth: i32,
    ) -> Result<HashMap<String, DownlineCount>, anyhow::Error>;

    async fn list_packages(&self) -> Result<Vec<Package>, anyhow::Error>;

    async fn search_users(&self, query: &str, limit: i64)
        -> Result<Vec<UserMatch>, anyhow::Error>;

    async fn missing_referrals(
        &self,
        search: Option<&str>,
        filter: &NodeFilter,
        exclude_id: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<User>, i64), anyhow::Error>;

    /// Applies a sponsor change atomically, re-validating it against the
    /// current state of the store.
    async fn set_sponsor(&self, write: &SponsorWrite)
        -> Result<SponsorWriteOutcome, anyhow::Error>;

    async fn sponsor_history(&self, user_id: &str) -> Result<Vec<SponsorChange>, anyhow::Error>;
}

pub fn like_pattern(search: &str) -> String {
    let escaped = search
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");

    format!("%{}%", escaped)
}

#[derive(Clone)]
pub struct UserRepository {
    conn: PgPool,
}

impl UserRepository {
    pub fn new(conn: PgPool) -> Self {
        Self { conn }
    }

    async fn fetch_user_where(
        &self,
        condition: &str,
        value: &str,
    ) -> Result<Option<User>, anyhow::Error> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE {}",
            USER_COLUMNS, condition
        ))
        .bind(value)
        .fetch_optional(&self.conn)
        .await?;

        Ok(user)
    }
}

#[async_trait]
impl UserStore for UserRepository {
    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, anyhow::Error> {
        self.fetch_user_where("id = $1", id).await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, anyhow::Error> {
        self.fetch_user_where("lower(email) = lower($1)", email.trim())
            .await
    }

    async fn get_user_by_legacy_id(
        &self,
        legacy_id: &str,
    ) -> Result<Option<User>, anyhow::Error> {
        self.fetch_user_where("legacy_id = $1", legacy_id.trim())
            .await
    }

    async fn get_default_root(&self) -> Result<Option<User>, anyhow::Error> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE sponsor_id IS NULL ORDER BY created_at, id LIMIT 1",
            USER_COLUMNS
        ))
        .fetch_optional(&self.conn)
        .await?;

        Ok(user)
    }

    async fn get_children(&self, parent_ids: &[String]) -> Result<Vec<User>, anyhow::Error> {
        if parent_ids.is_empty() {
            return Ok(vec![]);
        }

        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE sponsor_id = ANY($1)",
            USER_COLUMNS
        ))
        .bind(parent_ids)
        .fetch_all(&self.conn)
        .await?;

        Ok(users)
    }

    async fn get_ancestor_ids(
        &self,
        user_id: &str,
        max_hops: i32,
    ) -> Result<Vec<String>, anyhow::Error> {
        let ancestors: Vec<String> = sqlx::query_scalar(
            r#"
                WITH RECURSIVE chain(id, sponsor_id, hops) AS (
                    SELECT id, sponsor_id, 1 FROM users WHERE id = $1
                    UNION ALL
                    SELECT u.id, u.sponsor_id, c.hops + 1
                    FROM users u
                    JOIN chain c ON u.id = c.sponsor_id
                    WHERE c.hops < $2
                )
                SELECT sponsor_id FROM chain
                WHERE sponsor_id IS NOT NULL
                ORDER BY hops
            "#,
        )
        .bind(user_id)
        .bind(max_hops)
        .fetch_all(&self.conn)
        .await?;

        Ok(ancestors)
    }

    async fn downline_counts(
        &self,
        ids: &[String],
        max_depth: i32,
    ) -> Result<HashMap<String, DownlineCount>, anyhow::Error> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
                WITH RECURSIVE walk(origin, id, depth) AS (
                    SELECT u.sponsor_id, u.id, 1
                    FROM users u
                    WHERE u.sponsor_id = ANY($1)
                    UNION ALL
                    SELECT w.origin, u.id, w.depth + 1
                    FROM users u
                    JOIN walk w ON u.sponsor_id = w.id
                    WHERE w.depth < $2
                )
                SELECT
                    origin,
                    COUNT(*) FILTER (WHERE depth = 1),
                    COUNT(DISTINCT id)
                FROM walk
                GROUP BY origin
            "#,
        )
        .bind(ids)
        .bind(max_depth)
        .fetch_all(&self.conn)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(origin, direct, total)| (origin, DownlineCount { direct, total }))
            .collect())
    }

    async fn list_packages(&self) -> Result<Vec<Package>, anyhow::Error> {
        let packages = sqlx::query_as::<_, Package>("SELECT id, name FROM packages ORDER BY name")
            .fetch_all(&self.conn)
            .await?;

        Ok(packages)
    }

    async fn search_users(
        &self,
        query: &str,
        limit: i64,
    ) -> Result<Vec<UserMatch>, anyhow::Error> {
        let matches = sqlx::query_as::<_, UserMatch>(
            r#"
                SELECT id, email, name, legacy_id FROM users
                WHERE email ILIKE $1 OR name ILIKE $1 OR legacy_id ILIKE $1
                ORDER BY email
                LIMIT $2
            "#,
        )
        .bind(like_pattern(query))
        .bind(limit)
        .fetch_all(&self.conn)
        .await?;

        Ok(matches)
    }

    async fn missing_referrals(
        &self,
        search: Option<&str>,
        filter: &NodeFilter,
        exclude_id: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<User>, i64), anyhow::Error> {
        let pattern = search.map(like_pattern);

        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE {} ORDER BY created_at DESC, id LIMIT $6 OFFSET $7",
            USER_COLUMNS, MISSING_REFERRAL_FILTER
        ))
        .bind(exclude_id)
        .bind(&pattern)
        .bind(&filter.package_ids)
        .bind(filter.registration.from)
        .bind(filter.registration.to)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.conn)
        .await?;

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM users WHERE {}",
            MISSING_REFERRAL_FILTER
        ))
        .bind(exclude_id)
        .bind(&pattern)
        .bind(&filter.package_ids)
        .bind(filter.registration.from)
        .bind(filter.registration.to)
        .fetch_one(&self.conn)
        .await?;

        Ok((users, total))
    }

    async fn set_sponsor(
        &self,
        write: &SponsorWrite,
    ) -> Result<SponsorWriteOutcome, anyhow::Error> {
        let mut tx = self.conn.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SPONSOR_WRITE_LOCK)
            .execute(&mut *tx)
            .await?;

        let current: Option<Option<String>> =
            sqlx::query_scalar("SELECT sponsor_id FROM users WHERE id = $1 FOR UPDATE")
                .bind(&write.user_id)
                .fetch_optional(&mut *tx)
                .await?;

        let current_sponsor = match current {
            Some(sponsor_id) => sponsor_id,
            None => return Ok(SponsorWriteOutcome::UserMissing),
        };

        if current_sponsor != write.expected_sponsor_id {
            return Ok(SponsorWriteOutcome::Stale);
        }

        let sponsor_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
                .bind(&write.sponsor_id)
                .fetch_one(&mut *tx)
                .await?;

        if !sponsor_exists {
            return Ok(SponsorWriteOutcome::SponsorMissing);
        }

        // The chain starts at the new sponsor itself, so self-sponsorship is
        // caught here as well.
        let would_cycle: bool = sqlx::query_scalar(
            r#"
                WITH RECURSIVE chain(id, hops) AS (
                    SELECT $1::text, 0
                    UNION ALL
                    SELECT u.sponsor_id, c.hops + 1
                    FROM users u
                    JOIN chain c ON u.id = c.id
                    WHERE u.sponsor_id IS NOT NULL AND c.hops < $3
                )
                SELECT EXISTS(SELECT 1 FROM chain WHERE id = $2)
            "#,
        )
        .bind(&write.sponsor_id)
        .bind(&write.user_id)
        .bind(ANCESTRY_HOP_LIMIT)
        .fetch_one(&mut *tx)
        .await?;

        if would_cycle {
            return Ok(SponsorWriteOutcome::WouldCycle);
        }

        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET sponsor_id = $1, updated_at = CURRENT_TIMESTAMP WHERE id = $2 RETURNING {}",
            USER_COLUMNS
        ))
        .bind(&write.sponsor_id)
        .bind(&write.user_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
                INSERT INTO sponsor_changes
                (id, user_id, previous_sponsor_id, new_sponsor_id, kind)
                VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4().hyphenated().to_string())
        .bind(&write.user_id)
        .bind(&current_sponsor)
        .bind(&write.sponsor_id)
        .bind(write.kind.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SponsorWriteOutcome::Applied(user))
    }

    async fn sponsor_history(&self, user_id: &str) -> Result<Vec<SponsorChange>, anyhow::Error> {
        let changes = sqlx::query_as::<_, SponsorChange>(
            r#"
                SELECT id, user_id, previous_sponsor_id, new_sponsor_id, kind, created_at
                FROM sponsor_changes
                WHERE user_id = $1
                ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.conn)
        .await?;

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::like_pattern;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" ana "), "%ana%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }
}
