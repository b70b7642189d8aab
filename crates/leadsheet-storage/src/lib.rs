//! Conflict-aware persistence: store traits, the in-memory store, and the
//! Postgres store.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsheet_core::{
    CanonicalRecord, ColumnMapping, Credential, EntityKind, PersistedRecord, Profile,
    SheetConnection, SyncError,
};
use leadsheet_source::CredentialStore;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsheet-storage";

/// What the conflict-aware upsert did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The persisted counterpart carries a local edit; the external value
    /// was deliberately not applied.
    SkippedLocalEdit,
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn connection(&self, id: Uuid) -> Result<Option<SheetConnection>, SyncError>;
    async fn active_connections_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<SheetConnection>, SyncError>;
    async fn all_active_connections(&self) -> Result<Vec<SheetConnection>, SyncError>;
    async fn insert_connection(&self, connection: &SheetConnection) -> Result<(), SyncError>;
    async fn update_mappings(
        &self,
        id: Uuid,
        mappings: &[ColumnMapping],
    ) -> Result<(), SyncError>;
    /// Disconnect clears the active flag; connections are never hard-deleted
    /// while history exists.
    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), SyncError>;
    async fn stamp_last_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), SyncError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert keyed by `(connection_id, source_row_number, kind)`. The store
    /// itself enforces the local-edit guard so the skip is race-free.
    async fn upsert_record(
        &self,
        record: &CanonicalRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, SyncError>;

    async fn record_by_provenance(
        &self,
        connection_id: Uuid,
        source_row_number: u32,
        kind: EntityKind,
    ) -> Result<Option<PersistedRecord>, SyncError>;

    async fn records_for_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<PersistedRecord>, SyncError>;

    /// Hook for the write-back collaborator: flag a persisted record as
    /// locally modified so the next sync leaves it alone.
    async fn set_modified_locally(
        &self,
        connection_id: Uuid,
        source_row_number: u32,
        kind: EntityKind,
        modified: bool,
    ) -> Result<(), SyncError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profile_by_name(&self, full_name: &str) -> Result<Option<Profile>, SyncError>;
    /// Insert a profile; on a case-insensitive name conflict the existing
    /// profile wins and is returned.
    async fn insert_profile(&self, profile: &Profile) -> Result<Profile, SyncError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

type RecordKey = (Uuid, u32, EntityKind);

/// In-memory implementation of every store trait; backs tests and local
/// dry-runs without a database.
#[derive(Default)]
pub struct MemoryStore {
    connections: RwLock<HashMap<Uuid, SheetConnection>>,
    records: RwLock<HashMap<RecordKey, PersistedRecord>>,
    profiles: RwLock<HashMap<Uuid, Profile>>,
    credentials: RwLock<HashMap<Uuid, Credential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionStore for MemoryStore {
    async fn connection(&self, id: Uuid) -> Result<Option<SheetConnection>, SyncError> {
        Ok(self.connections.read().await.get(&id).cloned())
    }

    async fn active_connections_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<SheetConnection>, SyncError> {
        Ok(self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.user_id == user_id && c.is_active)
            .cloned()
            .collect())
    }

    async fn all_active_connections(&self) -> Result<Vec<SheetConnection>, SyncError> {
        let mut connections: Vec<SheetConnection> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect();
        connections.sort_by_key(|c| c.id);
        Ok(connections)
    }

    async fn insert_connection(&self, connection: &SheetConnection) -> Result<(), SyncError> {
        self.connections
            .write()
            .await
            .insert(connection.id, connection.clone());
        Ok(())
    }

    async fn update_mappings(
        &self,
        id: Uuid,
        mappings: &[ColumnMapping],
    ) -> Result<(), SyncError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or_else(|| SyncError::NotFound(format!("connection {id}")))?;
        connection.mappings = mappings.to_vec();
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), SyncError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or_else(|| SyncError::NotFound(format!("connection {id}")))?;
        connection.is_active = active;
        Ok(())
    }

    async fn stamp_last_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), SyncError> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&id)
            .ok_or_else(|| SyncError::NotFound(format!("connection {id}")))?;
        connection.last_synced_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_record(
        &self,
        record: &CanonicalRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, SyncError> {
        let key = (
            record.provenance.connection_id,
            record.provenance.source_row_number,
            record.kind(),
        );
        let mut records = self.records.write().await;
        match records.get_mut(&key) {
            Some(existing) if existing.modified_locally => Ok(UpsertOutcome::SkippedLocalEdit),
            Some(existing) => {
                existing.external_id = record.external_id.clone();
                existing.fields = record.fields.clone();
                existing.custom_fields = record.custom_fields.clone();
                existing.last_synced_at = synced_at;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                records.insert(
                    key,
                    PersistedRecord {
                        id: Uuid::new_v4(),
                        kind: record.kind(),
                        external_id: record.external_id.clone(),
                        connection_id: record.provenance.connection_id,
                        source_row_number: record.provenance.source_row_number,
                        fields: record.fields.clone(),
                        custom_fields: record.custom_fields.clone(),
                        last_synced_at: synced_at,
                        modified_locally: false,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn record_by_provenance(
        &self,
        connection_id: Uuid,
        source_row_number: u32,
        kind: EntityKind,
    ) -> Result<Option<PersistedRecord>, SyncError> {
        Ok(self
            .records
            .read()
            .await
            .get(&(connection_id, source_row_number, kind))
            .cloned())
    }

    async fn records_for_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<PersistedRecord>, SyncError> {
        let mut records: Vec<PersistedRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.connection_id == connection_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.source_row_number, r.kind.as_str()));
        Ok(records)
    }

    async fn set_modified_locally(
        &self,
        connection_id: Uuid,
        source_row_number: u32,
        kind: EntityKind,
        modified: bool,
    ) -> Result<(), SyncError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&(connection_id, source_row_number, kind))
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "record ({connection_id}, {source_row_number}, {kind})"
                ))
            })?;
        record.modified_locally = modified;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn profile_by_name(&self, full_name: &str) -> Result<Option<Profile>, SyncError> {
        let needle = full_name.trim().to_lowercase();
        Ok(self
            .profiles
            .read()
            .await
            .values()
            .find(|p| p.full_name.trim().to_lowercase() == needle)
            .cloned())
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<Profile, SyncError> {
        let mut profiles = self.profiles.write().await;
        let needle = profile.full_name.trim().to_lowercase();
        if let Some(existing) = profiles
            .values()
            .find(|p| p.full_name.trim().to_lowercase() == needle)
        {
            return Ok(existing.clone());
        }
        profiles.insert(profile.id, profile.clone());
        Ok(profile.clone())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn credential(&self, user_id: Uuid) -> Result<Option<Credential>, SyncError> {
        Ok(self.credentials.read().await.get(&user_id).cloned())
    }

    async fn upsert_credential(&self, credential: &Credential) -> Result<(), SyncError> {
        self.credentials
            .write()
            .await
            .insert(credential.user_id, credential.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

fn pg_err(err: sqlx::Error) -> SyncError {
    SyncError::Persistence(err.to_string())
}

fn json_err(err: serde_json::Error) -> SyncError {
    SyncError::Persistence(format!("json column: {err}"))
}

/// Postgres-backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(pg_err)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), SyncError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    fn connection_from_row(row: &sqlx::postgres::PgRow) -> Result<SheetConnection, SyncError> {
        let sheet_type: String = row.try_get("sheet_type").map_err(pg_err)?;
        let mappings_json: serde_json::Value = row.try_get("mappings").map_err(pg_err)?;
        Ok(SheetConnection {
            id: row.try_get("id").map_err(pg_err)?,
            user_id: row.try_get("user_id").map_err(pg_err)?,
            sheet_url: row.try_get("sheet_url").map_err(pg_err)?,
            sheet_name: row.try_get("sheet_name").map_err(pg_err)?,
            sheet_type: EntityKind::from_str(&sheet_type)?,
            mappings: serde_json::from_value(mappings_json).map_err(json_err)?,
            is_active: row.try_get("is_active").map_err(pg_err)?,
            last_synced_at: row.try_get("last_synced_at").map_err(pg_err)?,
        })
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<PersistedRecord, SyncError> {
        let kind: String = row.try_get("kind").map_err(pg_err)?;
        let fields_json: serde_json::Value = row.try_get("fields").map_err(pg_err)?;
        let custom_json: serde_json::Value = row.try_get("custom_fields").map_err(pg_err)?;
        let source_row_number: i32 = row.try_get("source_row_number").map_err(pg_err)?;
        Ok(PersistedRecord {
            id: row.try_get("id").map_err(pg_err)?,
            kind: EntityKind::from_str(&kind)?,
            external_id: row.try_get("external_id").map_err(pg_err)?,
            connection_id: row.try_get("connection_id").map_err(pg_err)?,
            source_row_number: source_row_number as u32,
            fields: serde_json::from_value(fields_json).map_err(json_err)?,
            custom_fields: serde_json::from_value(custom_json).map_err(json_err)?,
            last_synced_at: row.try_get("last_synced_at").map_err(pg_err)?,
            modified_locally: row.try_get("modified_locally").map_err(pg_err)?,
        })
    }
}

const CONNECTION_COLUMNS: &str =
    "id, user_id, sheet_url, sheet_name, sheet_type, mappings, is_active, last_synced_at";
const RECORD_COLUMNS: &str = "id, connection_id, source_row_number, kind, external_id, fields, \
                              custom_fields, last_synced_at, modified_locally";

#[async_trait]
impl ConnectionStore for PgStore {
    async fn connection(&self, id: Uuid) -> Result<Option<SheetConnection>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM sheet_connections WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;
        row.as_ref().map(Self::connection_from_row).transpose()
    }

    async fn active_connections_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<SheetConnection>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM sheet_connections \
             WHERE user_id = $1 AND is_active ORDER BY id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        rows.iter().map(Self::connection_from_row).collect()
    }

    async fn all_active_connections(&self) -> Result<Vec<SheetConnection>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM sheet_connections WHERE is_active ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        rows.iter().map(Self::connection_from_row).collect()
    }

    async fn insert_connection(&self, connection: &SheetConnection) -> Result<(), SyncError> {
        let mappings = serde_json::to_value(&connection.mappings).map_err(json_err)?;
        sqlx::query(
            "INSERT INTO sheet_connections \
             (id, user_id, sheet_url, sheet_name, sheet_type, mappings, is_active, last_synced_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(connection.id)
        .bind(connection.user_id)
        .bind(&connection.sheet_url)
        .bind(&connection.sheet_name)
        .bind(connection.sheet_type.as_str())
        .bind(mappings)
        .bind(connection.is_active)
        .bind(connection.last_synced_at)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn update_mappings(
        &self,
        id: Uuid,
        mappings: &[ColumnMapping],
    ) -> Result<(), SyncError> {
        let mappings = serde_json::to_value(mappings).map_err(json_err)?;
        let result = sqlx::query("UPDATE sheet_connections SET mappings = $2 WHERE id = $1")
            .bind(id)
            .bind(mappings)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), SyncError> {
        let result = sqlx::query("UPDATE sheet_connections SET is_active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("connection {id}")));
        }
        Ok(())
    }

    async fn stamp_last_synced(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), SyncError> {
        sqlx::query("UPDATE sheet_connections SET last_synced_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert_record(
        &self,
        record: &CanonicalRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, SyncError> {
        let fields = serde_json::to_value(&record.fields).map_err(json_err)?;
        let custom_fields = serde_json::to_value(&record.custom_fields).map_err(json_err)?;
        // The local-edit guard is part of the conflict clause, so concurrent
        // write-backs cannot lose against this update.
        let row = sqlx::query(
            "INSERT INTO canonical_records \
             (id, connection_id, source_row_number, kind, external_id, fields, custom_fields, \
              last_synced_at, modified_locally) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE) \
             ON CONFLICT (connection_id, source_row_number, kind) DO UPDATE SET \
                 external_id = EXCLUDED.external_id, \
                 fields = EXCLUDED.fields, \
                 custom_fields = EXCLUDED.custom_fields, \
                 last_synced_at = EXCLUDED.last_synced_at \
             WHERE canonical_records.modified_locally = FALSE \
             RETURNING (xmax = 0) AS inserted",
        )
        .bind(Uuid::new_v4())
        .bind(record.provenance.connection_id)
        .bind(record.provenance.source_row_number as i32)
        .bind(record.kind().as_str())
        .bind(&record.external_id)
        .bind(fields)
        .bind(custom_fields)
        .bind(synced_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;

        match row {
            None => Ok(UpsertOutcome::SkippedLocalEdit),
            Some(row) => {
                let inserted: bool = row.try_get("inserted").map_err(pg_err)?;
                Ok(if inserted {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Updated
                })
            }
        }
    }

    async fn record_by_provenance(
        &self,
        connection_id: Uuid,
        source_row_number: u32,
        kind: EntityKind,
    ) -> Result<Option<PersistedRecord>, SyncError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM canonical_records \
             WHERE connection_id = $1 AND source_row_number = $2 AND kind = $3"
        ))
        .bind(connection_id)
        .bind(source_row_number as i32)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn records_for_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<PersistedRecord>, SyncError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM canonical_records \
             WHERE connection_id = $1 ORDER BY source_row_number, kind"
        ))
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn set_modified_locally(
        &self,
        connection_id: Uuid,
        source_row_number: u32,
        kind: EntityKind,
        modified: bool,
    ) -> Result<(), SyncError> {
        let result = sqlx::query(
            "UPDATE canonical_records SET modified_locally = $4 \
             WHERE connection_id = $1 AND source_row_number = $2 AND kind = $3",
        )
        .bind(connection_id)
        .bind(source_row_number as i32)
        .bind(kind.as_str())
        .bind(modified)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!(
                "record ({connection_id}, {source_row_number}, {kind})"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn profile_by_name(&self, full_name: &str) -> Result<Option<Profile>, SyncError> {
        let row = sqlx::query(
            "SELECT id, full_name, email, role FROM profiles \
             WHERE lower(full_name) = lower($1)",
        )
        .bind(full_name.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(row.map(|row| Profile {
            id: row.get("id"),
            full_name: row.get("full_name"),
            email: row.get("email"),
            role: row.get("role"),
        }))
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<Profile, SyncError> {
        let result = sqlx::query(
            "INSERT INTO profiles (id, full_name, email, role) VALUES ($1, $2, $3, $4) \
             ON CONFLICT ((lower(full_name))) DO NOTHING",
        )
        .bind(profile.id)
        .bind(&profile.full_name)
        .bind(&profile.email)
        .bind(&profile.role)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        if result.rows_affected() > 0 {
            return Ok(profile.clone());
        }
        // Lost the race: another sync created this name first.
        self.profile_by_name(&profile.full_name)
            .await?
            .ok_or_else(|| {
                SyncError::Persistence(format!(
                    "profile {:?} vanished after conflict",
                    profile.full_name
                ))
            })
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn credential(&self, user_id: Uuid) -> Result<Option<Credential>, SyncError> {
        let row = sqlx::query(
            "SELECT user_id, access_token, refresh_token, expires_at, updated_at \
             FROM credentials WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(row.map(|row| Credential {
            user_id: row.get("user_id"),
            access_token: row.get("access_token"),
            refresh_token: row.get("refresh_token"),
            expires_at: row.get("expires_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn upsert_credential(&self, credential: &Credential) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT INTO credentials (user_id, access_token, refresh_token, expires_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 access_token = EXCLUDED.access_token, \
                 refresh_token = EXCLUDED.refresh_token, \
                 expires_at = EXCLUDED.expires_at, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(credential.user_id)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expires_at)
        .bind(credential.updated_at)
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadsheet_core::{EntityFields, LeadFields, RowProvenance};

    fn lead_record(connection_id: Uuid, row: u32, name: &str) -> CanonicalRecord {
        CanonicalRecord {
            external_id: format!("row-{row}"),
            provenance: RowProvenance {
                connection_id,
                source_row_number: row,
            },
            fields: EntityFields::Lead(LeadFields {
                name: Some(name.to_string()),
                email: Some(format!("{}@x.com", name.to_lowercase())),
                ..LeadFields::default()
            }),
            custom_fields: Default::default(),
        }
    }

    #[tokio::test]
    async fn memory_upsert_is_idempotent_by_provenance() {
        let store = MemoryStore::new();
        let connection_id = Uuid::new_v4();
        let record = lead_record(connection_id, 2, "Ada");

        assert_eq!(
            store.upsert_record(&record, Utc::now()).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_record(&record, Utc::now()).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(
            store
                .records_for_connection(connection_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn memory_upsert_respects_local_edits() {
        let store = MemoryStore::new();
        let connection_id = Uuid::new_v4();
        let record = lead_record(connection_id, 2, "Ada");
        store.upsert_record(&record, Utc::now()).await.unwrap();
        store
            .set_modified_locally(connection_id, 2, EntityKind::Leads, true)
            .await
            .unwrap();

        let changed = lead_record(connection_id, 2, "Renamed");
        assert_eq!(
            store.upsert_record(&changed, Utc::now()).await.unwrap(),
            UpsertOutcome::SkippedLocalEdit
        );
        let persisted = store
            .record_by_provenance(connection_id, 2, EntityKind::Leads)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.fields.display_name(), Some("Ada"));
    }

    #[tokio::test]
    async fn memory_profile_insert_dedupes_case_insensitively() {
        let store = MemoryStore::new();
        let first = Profile {
            id: Uuid::new_v4(),
            full_name: "Jane Doe".into(),
            email: "jane.doe@placeholder.internal".into(),
            role: "closer".into(),
        };
        let inserted = store.insert_profile(&first).await.unwrap();
        assert_eq!(inserted.id, first.id);

        let duplicate = Profile {
            id: Uuid::new_v4(),
            full_name: "JANE DOE".into(),
            email: "other@placeholder.internal".into(),
            role: "setter".into(),
        };
        let winner = store.insert_profile(&duplicate).await.unwrap();
        assert_eq!(winner.id, first.id);
        assert_eq!(
            store.profile_by_name("jane doe").await.unwrap().unwrap().id,
            first.id
        );
    }

    #[tokio::test]
    async fn memory_disconnect_clears_active_flag_without_deleting() {
        let store = MemoryStore::new();
        let connection = SheetConnection {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            sheet_url: "https://docs.google.com/spreadsheets/d/abc/edit#gid=0".into(),
            sheet_name: Some("Leads".into()),
            sheet_type: EntityKind::Leads,
            mappings: vec![],
            is_active: true,
            last_synced_at: None,
        };
        store.insert_connection(&connection).await.unwrap();
        store.set_active(connection.id, false).await.unwrap();

        assert!(store.all_active_connections().await.unwrap().is_empty());
        assert!(store.connection(connection.id).await.unwrap().is_some());
    }
}
