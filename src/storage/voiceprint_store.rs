//! Voiceprint records and the verification attempt audit log.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, Row};
use tokio::task;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::Database;

/// Relational mirror of an enrolled centroid.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VoiceprintRecord {
    pub id: Uuid,
    pub customer_id: String,
    /// Deterministic point id of the centroid in the vector store.
    pub qdrant_vector_id: i64,
    pub is_active: bool,
    /// Cumulative flag: has this voiceprint ever verified successfully.
    pub verification: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One row of the append-only verification audit log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VerificationAttempt {
    pub id: Uuid,
    pub voiceprint_id: Uuid,
    pub raw_plda_score: f64,
    pub as_norm_score: f64,
    pub threshold: f64,
    pub count: i32,
    pub created_at: DateTime<Utc>,
}

/// Storage operations over voiceprints and attempts.
#[derive(Clone)]
pub struct VoiceprintStore {
    db: Database,
}

impl VoiceprintStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch the active voiceprint for a customer, if any.
    pub async fn get_active(&self, customer_id: &str) -> Result<Option<VoiceprintRecord>> {
        let connection = Arc::clone(&self.db.connection);
        let customer_id = customer_id.to_string();

        task::spawn_blocking(move || -> Result<Option<VoiceprintRecord>> {
            let conn = connection.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, customer_id, qdrant_vector_id, is_active, verification,
                        last_verified_at, created_at
                 FROM voiceprints
                 WHERE customer_id = ?1 AND is_active = 1",
            )?;
            match stmt.query_row(params![customer_id], row_to_voiceprint) {
                Ok(record) => Ok(Some(record)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    /// Delete any existing voiceprint for the customer and insert a fresh
    /// active one, in a single transaction. Cascades wipe the old attempt
    /// history with the old row.
    pub async fn replace(&self, customer_id: &str, qdrant_vector_id: i64) -> Result<VoiceprintRecord> {
        let connection = Arc::clone(&self.db.connection);
        let customer_id = customer_id.to_string();

        task::spawn_blocking(move || -> Result<VoiceprintRecord> {
            let conn = connection.lock().unwrap();
            let tx = conn.unchecked_transaction()?;

            tx.execute(
                "DELETE FROM voiceprints WHERE customer_id = ?1",
                params![customer_id],
            )?;

            let record = VoiceprintRecord {
                id: Uuid::new_v4(),
                customer_id: customer_id.clone(),
                qdrant_vector_id,
                is_active: true,
                verification: false,
                last_verified_at: None,
                created_at: Utc::now(),
            };
            let insert = tx.execute(
                "INSERT INTO voiceprints (
                    id, customer_id, qdrant_vector_id, is_active, verification,
                    last_verified_at, created_at
                 ) VALUES (?1, ?2, ?3, 1, 0, NULL, ?4)",
                params![
                    record.id.to_string(),
                    record.customer_id,
                    record.qdrant_vector_id,
                    record.created_at.to_rfc3339(),
                ],
            );
            if let Err(e) = insert {
                return Err(map_constraint(e, &customer_id));
            }

            tx.commit()?;
            Ok(record)
        })
        .await?
    }

    /// Record a successful verification on the voiceprint itself.
    pub async fn mark_verified(&self, voiceprint_id: Uuid, at_time: DateTime<Utc>) -> Result<()> {
        let connection = Arc::clone(&self.db.connection);

        task::spawn_blocking(move || -> Result<()> {
            let conn = connection.lock().unwrap();
            conn.execute(
                "UPDATE voiceprints SET verification = 1, last_verified_at = ?1 WHERE id = ?2",
                params![at_time.to_rfc3339(), voiceprint_id.to_string()],
            )?;
            Ok(())
        })
        .await?
    }

    /// Append one row to the audit log. The `count` column is vestigial in
    /// the schema and always written as 0.
    pub async fn append_attempt(
        &self,
        voiceprint_id: Uuid,
        raw_plda_score: f64,
        as_norm_score: f64,
        threshold: f64,
    ) -> Result<VerificationAttempt> {
        let connection = Arc::clone(&self.db.connection);

        task::spawn_blocking(move || -> Result<VerificationAttempt> {
            let conn = connection.lock().unwrap();
            let attempt = VerificationAttempt {
                id: Uuid::new_v4(),
                voiceprint_id,
                raw_plda_score,
                as_norm_score,
                threshold,
                count: 0,
                created_at: Utc::now(),
            };
            conn.execute(
                "INSERT INTO verification_attempts (
                    id, voiceprint_id, raw_plda_score, as_norm_score, threshold,
                    count, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attempt.id.to_string(),
                    attempt.voiceprint_id.to_string(),
                    attempt.raw_plda_score,
                    attempt.as_norm_score,
                    attempt.threshold,
                    attempt.count,
                    attempt.created_at.to_rfc3339(),
                ],
            )?;
            Ok(attempt)
        })
        .await?
    }

    /// Remove a customer's voiceprint; attempts cascade with the row.
    /// Returns false when nothing existed (idempotent).
    pub async fn delete(&self, customer_id: &str) -> Result<bool> {
        let connection = Arc::clone(&self.db.connection);
        let customer_id = customer_id.to_string();

        task::spawn_blocking(move || -> Result<bool> {
            let conn = connection.lock().unwrap();
            let rows = conn.execute(
                "DELETE FROM voiceprints WHERE customer_id = ?1",
                params![customer_id],
            )?;
            Ok(rows > 0)
        })
        .await?
    }

    /// Number of voiceprint rows (active or not) for a customer.
    pub async fn count_for_customer(&self, customer_id: &str) -> Result<i64> {
        let connection = Arc::clone(&self.db.connection);
        let customer_id = customer_id.to_string();

        task::spawn_blocking(move || -> Result<i64> {
            let conn = connection.lock().unwrap();
            let count: i64 = conn
                .prepare("SELECT COUNT(*) FROM voiceprints WHERE customer_id = ?1")?
                .query_row(params![customer_id], |row| row.get(0))?;
            Ok(count)
        })
        .await?
    }

    /// Attempt history for a customer, newest first. `None` when the
    /// customer has no voiceprint at all.
    pub async fn history(&self, customer_id: &str) -> Result<Option<Vec<VerificationAttempt>>> {
        let connection = Arc::clone(&self.db.connection);
        let customer_id = customer_id.to_string();

        task::spawn_blocking(move || -> Result<Option<Vec<VerificationAttempt>>> {
            let conn = connection.lock().unwrap();
            let voiceprint_id: Option<String> = match conn
                .prepare("SELECT id FROM voiceprints WHERE customer_id = ?1")?
                .query_row(params![customer_id], |row| row.get(0))
            {
                Ok(id) => Some(id),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            };
            let Some(voiceprint_id) = voiceprint_id else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT id, voiceprint_id, raw_plda_score, as_norm_score, threshold,
                        count, created_at
                 FROM verification_attempts
                 WHERE voiceprint_id = ?1
                 ORDER BY created_at DESC",
            )?;
            let attempts = stmt
                .query_map(params![voiceprint_id], row_to_attempt)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Some(attempts))
        })
        .await?
    }

    /// Direct attempt count for a voiceprint; used by tests and invariant
    /// checks.
    pub async fn attempt_count(&self, voiceprint_id: Uuid) -> Result<i64> {
        let connection = Arc::clone(&self.db.connection);

        task::spawn_blocking(move || -> Result<i64> {
            let conn = connection.lock().unwrap();
            let count: i64 = conn
                .prepare("SELECT COUNT(*) FROM verification_attempts WHERE voiceprint_id = ?1")?
                .query_row(params![voiceprint_id.to_string()], |row| row.get(0))?;
            Ok(count)
        })
        .await?
    }
}

fn map_constraint(err: rusqlite::Error, customer_id: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(inner, _) = &err {
        if inner.code == ErrorCode::ConstraintViolation {
            return Error::Conflict {
                message: format!("concurrent enrollment for customer {}", customer_id),
            };
        }
    }
    err.into()
}

fn parse_uuid(raw: String) -> std::result::Result<Uuid, rusqlite::Error> {
    Uuid::parse_str(&raw).map_err(|_| {
        rusqlite::Error::InvalidColumnType(0, "uuid".to_string(), rusqlite::types::Type::Text)
    })
}

fn parse_timestamp(raw: String) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                0,
                "timestamp".to_string(),
                rusqlite::types::Type::Text,
            )
        })
}

fn row_to_voiceprint(row: &Row) -> std::result::Result<VoiceprintRecord, rusqlite::Error> {
    let last_verified_at: Option<String> = row.get("last_verified_at")?;
    Ok(VoiceprintRecord {
        id: parse_uuid(row.get::<_, String>("id")?)?,
        customer_id: row.get("customer_id")?,
        qdrant_vector_id: row.get("qdrant_vector_id")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        verification: row.get::<_, i64>("verification")? != 0,
        last_verified_at: last_verified_at.map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(row.get::<_, String>("created_at")?)?,
    })
}

fn row_to_attempt(row: &Row) -> std::result::Result<VerificationAttempt, rusqlite::Error> {
    Ok(VerificationAttempt {
        id: parse_uuid(row.get::<_, String>("id")?)?,
        voiceprint_id: parse_uuid(row.get::<_, String>("voiceprint_id")?)?,
        raw_plda_score: row.get("raw_plda_score")?,
        as_norm_score: row.get("as_norm_score")?,
        threshold: row.get("threshold")?,
        count: row.get("count")?,
        created_at: parse_timestamp(row.get::<_, String>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> VoiceprintStore {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        VoiceprintStore::new(db)
    }

    #[tokio::test]
    async fn replace_creates_active_record() {
        let store = test_store().await;
        let record = store.replace("alice", 12345).await.unwrap();
        assert_eq!(record.customer_id, "alice");
        assert_eq!(record.qdrant_vector_id, 12345);
        assert!(record.is_active);
        assert!(!record.verification);
        assert!(record.last_verified_at.is_none());

        let fetched = store.get_active("alice").await.unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
    }

    #[tokio::test]
    async fn replace_leaves_exactly_one_row() {
        let store = test_store().await;
        let first = store.replace("alice", 1).await.unwrap();
        let second = store.replace("alice", 1).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.created_at >= first.created_at);

        assert_eq!(store.count_for_customer("alice").await.unwrap(), 1);
        let active = store.get_active("alice").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
    }

    #[tokio::test]
    async fn replace_cascades_old_attempts() {
        let store = test_store().await;
        let first = store.replace("alice", 1).await.unwrap();
        store.append_attempt(first.id, 10.0, 4.0, 3.0).await.unwrap();
        assert_eq!(store.attempt_count(first.id).await.unwrap(), 1);

        let second = store.replace("alice", 1).await.unwrap();
        assert_eq!(store.attempt_count(first.id).await.unwrap(), 0);
        assert_eq!(store.attempt_count(second.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_verified_sets_flag_and_timestamp() {
        let store = test_store().await;
        let record = store.replace("alice", 1).await.unwrap();
        let now = Utc::now();
        store.mark_verified(record.id, now).await.unwrap();

        let fetched = store.get_active("alice").await.unwrap().unwrap();
        assert!(fetched.verification);
        let stamped = fetched.last_verified_at.unwrap();
        assert!((stamped - now).num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn attempts_are_appended_with_zero_count() {
        let store = test_store().await;
        let record = store.replace("alice", 1).await.unwrap();
        let attempt = store.append_attempt(record.id, 12.5, 4.2, 3.0).await.unwrap();
        assert_eq!(attempt.count, 0);
        assert_eq!(attempt.voiceprint_id, record.id);

        let history = store.history("alice").await.unwrap().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, attempt.id);
        assert!((history[0].raw_plda_score - 12.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let store = test_store().await;
        let record = store.replace("alice", 1).await.unwrap();
        let first = store.append_attempt(record.id, 1.0, 1.0, 3.0).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.append_attempt(record.id, 2.0, 2.0, 3.0).await.unwrap();

        let history = store.history("alice").await.unwrap().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].id, first.id);
    }

    #[tokio::test]
    async fn history_for_unknown_customer_is_none() {
        let store = test_store().await;
        assert!(store.history("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_cascades() {
        let store = test_store().await;
        let record = store.replace("alice", 1).await.unwrap();
        store.append_attempt(record.id, 1.0, 1.0, 3.0).await.unwrap();

        assert!(store.delete("alice").await.unwrap());
        assert!(store.get_active("alice").await.unwrap().is_none());
        assert_eq!(store.attempt_count(record.id).await.unwrap(), 0);

        // Second delete finds nothing and does not fail.
        assert!(!store.delete("alice").await.unwrap());
    }

    #[tokio::test]
    async fn customers_are_independent() {
        let store = test_store().await;
        store.replace("alice", 1).await.unwrap();
        store.replace("bob", 2).await.unwrap();

        assert!(store.delete("alice").await.unwrap());
        assert!(store.get_active("bob").await.unwrap().is_some());
    }
}
