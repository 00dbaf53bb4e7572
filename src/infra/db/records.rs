use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::application::repos::{
    PersistedRecord, RecordsRepo, RepoError, UpsertEntry, UpsertOutcome,
};
use crate::domain::identity::SubjectId;
use crate::domain::records::DomainRecord;
use crate::domain::types::Scope;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct RelationRow {
    fact_key: String,
    manual: bool,
    note: Option<String>,
    credit: Option<f64>,
    body: serde_json::Value,
}

impl TryFrom<RelationRow> for PersistedRecord {
    type Error = RepoError;

    fn try_from(row: RelationRow) -> Result<Self, Self::Error> {
        let record: DomainRecord =
            serde_json::from_value(row.body).map_err(|err| RepoError::Integrity {
                message: format!("stored fact {} does not decode: {err}", row.fact_key),
            })?;
        Ok(PersistedRecord {
            record,
            fact_key: row.fact_key,
            manual: row.manual,
            note: row.note,
            credit: row.credit,
        })
    }
}

impl PostgresRepositories {
    /// Writes one batch of entries: facts first (insert-if-absent, keyed by
    /// content hash), then one relation row each. `update_on_conflict`
    /// selects between refreshing an existing relation's mutable columns
    /// and leaving it untouched.
    async fn insert_entries(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subject: &SubjectId,
        scope: &Scope,
        entries: &[UpsertEntry],
        update_on_conflict: bool,
    ) -> Result<UpsertOutcome, RepoError> {
        let mut outcome = UpsertOutcome::default();
        let segment = scope.segment();

        for entry in entries {
            let fact_key = entry.record.natural_key();
            let body = serde_json::to_value(&entry.record).map_err(RepoError::from_persistence)?;

            let new_facts = sqlx::query(
                r#"
                INSERT INTO facts (natural_key, kind, body)
                VALUES ($1, $2, $3)
                ON CONFLICT (natural_key) DO NOTHING
                "#,
            )
            .bind(&fact_key)
            .bind(entry.record.kind().as_str())
            .bind(&body)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
            outcome.facts_inserted += new_facts;

            if update_on_conflict {
                // xmax is zero only for a row created by this transaction,
                // which distinguishes a fresh insert from a conflict update.
                let inserted: bool = sqlx::query_scalar(
                    r#"
                    INSERT INTO relations (id, subject, fact_key, scope, manual, note, credit)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (subject, fact_key, scope, manual) DO UPDATE
                        SET note = EXCLUDED.note,
                            credit = EXCLUDED.credit,
                            recycled = FALSE,
                            updated_at = now()
                    RETURNING (xmax = 0) AS inserted
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(subject.as_str())
                .bind(&fact_key)
                .bind(&segment)
                .bind(entry.manual)
                .bind(&entry.note)
                .bind(entry.credit)
                .fetch_one(&mut **tx)
                .await
                .map_err(map_sqlx_error)?;
                if inserted {
                    outcome.relations_inserted += 1;
                } else {
                    outcome.relations_updated += 1;
                }
            } else {
                let affected = sqlx::query(
                    r#"
                    INSERT INTO relations (id, subject, fact_key, scope, manual, note, credit)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (subject, fact_key, scope, manual) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(subject.as_str())
                .bind(&fact_key)
                .bind(&segment)
                .bind(entry.manual)
                .bind(&entry.note)
                .bind(entry.credit)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected();
                outcome.relations_inserted += affected;
            }
        }

        Ok(outcome)
    }

    async fn enforce_relation_cap(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subject: &SubjectId,
        segment: &str,
    ) -> Result<(), RepoError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM relations
            WHERE subject = $1 AND scope = $2 AND recycled = FALSE
            "#,
        )
        .bind(subject.as_str())
        .bind(segment)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        let count = u64::try_from(count)
            .map_err(|_| RepoError::from_persistence("relation count exceeds supported range"))?;
        if count > u64::from(self.relation_cap) {
            return Err(RepoError::CapExceeded {
                limit: self.relation_cap,
                count,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordsRepo for PostgresRepositories {
    async fn upsert(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        entries: &[UpsertEntry],
    ) -> Result<UpsertOutcome, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let outcome = self
            .insert_entries(&mut tx, subject, scope, entries, true)
            .await?;
        self.enforce_relation_cap(&mut tx, subject, &scope.segment())
            .await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn replace_scope(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        entries: &[UpsertEntry],
    ) -> Result<UpsertOutcome, RepoError> {
        let segment = scope.segment();
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        // Manual rows survive a resync; only scraped relations are replaced.
        sqlx::query(
            r#"
            DELETE FROM relations
            WHERE subject = $1 AND scope = $2 AND manual = FALSE
            "#,
        )
        .bind(subject.as_str())
        .bind(&segment)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let outcome = self
            .insert_entries(&mut tx, subject, scope, entries, false)
            .await?;
        self.enforce_relation_cap(&mut tx, subject, &segment)
            .await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn list_scope(
        &self,
        subject: &SubjectId,
        scope: &Scope,
    ) -> Result<Vec<PersistedRecord>, RepoError> {
        let rows: Vec<RelationRow> = sqlx::query_as(
            r#"
            SELECT r.fact_key, r.manual, r.note, r.credit, f.body
            FROM relations r
            INNER JOIN facts f ON f.natural_key = r.fact_key
            WHERE r.subject = $1 AND r.scope = $2 AND r.recycled = FALSE
            ORDER BY r.created_at, r.fact_key
            "#,
        )
        .bind(subject.as_str())
        .bind(scope.segment())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(PersistedRecord::try_from).collect()
    }

    async fn recycle(
        &self,
        subject: &SubjectId,
        scope: &Scope,
        fact_key: &str,
    ) -> Result<(), RepoError> {
        let affected = sqlx::query(
            r#"
            UPDATE relations
            SET recycled = TRUE, updated_at = now()
            WHERE subject = $1 AND scope = $2 AND fact_key = $3 AND recycled = FALSE
            "#,
        )
        .bind(subject.as_str())
        .bind(scope.segment())
        .bind(fact_key)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

        if affected == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}
