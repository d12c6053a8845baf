//! Store backends and reconciliation primitives for CUES.
//!
//! The store is reached only through [`SyncStore`]/[`StoreTx`], so the
//! pipeline runs unchanged against Postgres ([`PgStore`]) or the in-memory
//! backend ([`MemStore`]) used by dry runs and tests.
//!
//! Expected schema, provisioned outside this job:
//!
//! ```text
//! categories(id BIGINT PK, name TEXT UNIQUE)
//! districts(id BIGINT PK, name TEXT UNIQUE)
//! events(id BIGINT PK, title, place, organizer, audience, fee, performers,
//!        program, description, organizer_url, image_url, registered_at,
//!        ticket, starts_at, ends_at, theme_code, latitude, longitude,
//!        is_free, homepage_url, category_id, district_id, synced_at,
//!        created_at, updated_at, UNIQUE (title, starts_at))
//! ```
//!
//! The fixed dimension rows of `cues_core::FIXED_CATEGORIES` /
//! `FIXED_DISTRICTS` are assumed seeded; id sequences start past them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use cues_core::{DimensionKind, EventRecord, FixedDimensions, UpsertOutcome, FALLBACK_LABEL};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;

pub const CRATE_NAME: &str = "cues-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {entity} row: {detail}")]
    Conflict {
        entity: &'static str,
        detail: String,
    },
    #[error("no {entity} row with id {id}")]
    Missing { entity: &'static str, id: i64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Connection handle that can open batch-scoped transactions.
#[async_trait]
pub trait SyncStore: Send + Sync {
    type Tx: StoreTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One open transaction. Dropping an uncommitted transaction rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    async fn find_dimension(
        &mut self,
        kind: DimensionKind,
        label: &str,
    ) -> Result<Option<i64>, StoreError>;

    async fn insert_dimension(
        &mut self,
        kind: DimensionKind,
        label: &str,
    ) -> Result<i64, StoreError>;

    async fn find_event(
        &mut self,
        title: &str,
        starts_at: NaiveDateTime,
    ) -> Result<Option<i64>, StoreError>;

    async fn insert_event(
        &mut self,
        record: &EventRecord,
        starts_at: NaiveDateTime,
        category_id: i64,
        district_id: i64,
        observed_at: NaiveDateTime,
    ) -> Result<i64, StoreError>;

    async fn update_event(
        &mut self,
        id: i64,
        record: &EventRecord,
        category_id: i64,
        district_id: i64,
        observed_at: NaiveDateTime,
    ) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// Resolve a free-text label to a dimension id.
///
/// An empty or absent label collapses to the catch-all label first. Labels
/// in the fixed table resolve without touching the store; anything else is
/// looked up by exact name and inserted on first encounter. Concurrent runs
/// racing on the same novel label are unguarded here; the unique constraint
/// on the label column rejects the second writer.
pub async fn resolve_dimension<T: StoreTx>(
    tx: &mut T,
    fixed: &FixedDimensions,
    kind: DimensionKind,
    label: Option<&str>,
) -> Result<i64, StoreError> {
    let label = match label.map(str::trim) {
        Some(l) if !l.is_empty() => l,
        _ => FALLBACK_LABEL,
    };
    if let Some(id) = fixed.lookup(kind, label) {
        return Ok(id);
    }
    if let Some(id) = tx.find_dimension(kind, label).await? {
        return Ok(id);
    }
    tx.insert_dimension(kind, label).await
}

/// Insert or update one event by its (title, starts_at) natural key.
///
/// A record with no parseable start timestamp is keyed on `observed_at`
/// instead of being dropped. Known gap: re-running the job over such a
/// record inserts a fresh row each run rather than updating the earlier
/// placeholder. On update, every mutable attribute and the `synced_at`/
/// `updated_at` stamps are rewritten; `starts_at` and `created_at` never
/// are.
pub async fn apply_event<T: StoreTx>(
    tx: &mut T,
    record: &EventRecord,
    category_id: i64,
    district_id: i64,
    observed_at: NaiveDateTime,
) -> Result<(i64, UpsertOutcome), StoreError> {
    let starts_at = record.starts_at.unwrap_or(observed_at);
    match tx.find_event(&record.title, starts_at).await? {
        Some(id) => {
            tx.update_event(id, record, category_id, district_id, observed_at)
                .await?;
            Ok((id, UpsertOutcome::Updated))
        }
        None => {
            let id = tx
                .insert_event(record, starts_at, category_id, district_id, observed_at)
                .await?;
            Ok((id, UpsertOutcome::Inserted))
        }
    }
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SyncStore for PgStore {
    type Tx = PgStoreTx;

    async fn begin(&self) -> Result<PgStoreTx, StoreError> {
        Ok(PgStoreTx {
            tx: self.pool.begin().await?,
        })
    }
}

fn map_unique_violation(entity: &'static str, detail: String, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict { entity, detail }
        }
        _ => StoreError::Sqlx(err),
    }
}

const INSERT_EVENT_SQL: &str = "INSERT INTO events (
        title, place, organizer, audience, fee,
        performers, program, description, organizer_url, image_url,
        registered_at, ticket, starts_at, ends_at, theme_code,
        latitude, longitude, is_free, homepage_url,
        category_id, district_id, synced_at, created_at, updated_at
    ) VALUES (
        $1, $2, $3, $4, $5,
        $6, $7, $8, $9, $10,
        $11, $12, $13, $14, $15,
        $16, $17, $18, $19,
        $20, $21, $22, $23, $24
    ) RETURNING id";

const UPDATE_EVENT_SQL: &str = "UPDATE events SET
        place = $1, organizer = $2, audience = $3, fee = $4,
        performers = $5, program = $6, description = $7,
        organizer_url = $8, image_url = $9, registered_at = $10,
        ticket = $11, ends_at = $12, theme_code = $13,
        latitude = $14, longitude = $15, is_free = $16,
        homepage_url = $17, category_id = $18, district_id = $19,
        synced_at = $20, updated_at = $21
    WHERE id = $22";

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn find_dimension(
        &mut self,
        kind: DimensionKind,
        label: &str,
    ) -> Result<Option<i64>, StoreError> {
        let query = format!("SELECT id FROM {} WHERE name = $1", kind.table());
        let row = sqlx::query(&query)
            .bind(label)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|r| r.try_get("id")).transpose()?)
    }

    async fn insert_dimension(
        &mut self,
        kind: DimensionKind,
        label: &str,
    ) -> Result<i64, StoreError> {
        let query = format!("INSERT INTO {} (name) VALUES ($1) RETURNING id", kind.table());
        let row = sqlx::query(&query)
            .bind(label)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| map_unique_violation(kind.table(), label.to_string(), err))?;
        Ok(row.try_get("id")?)
    }

    async fn find_event(
        &mut self,
        title: &str,
        starts_at: NaiveDateTime,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT id FROM events WHERE title = $1 AND starts_at = $2")
            .bind(title)
            .bind(starts_at)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|r| r.try_get("id")).transpose()?)
    }

    async fn insert_event(
        &mut self,
        record: &EventRecord,
        starts_at: NaiveDateTime,
        category_id: i64,
        district_id: i64,
        observed_at: NaiveDateTime,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(INSERT_EVENT_SQL)
            .bind(&record.title)
            .bind(&record.place)
            .bind(&record.organizer)
            .bind(&record.audience)
            .bind(&record.fee)
            .bind(&record.performers)
            .bind(&record.program)
            .bind(&record.description)
            .bind(&record.organizer_url)
            .bind(&record.image_url)
            .bind(record.registered_at)
            .bind(&record.ticket)
            .bind(starts_at)
            .bind(record.ends_at)
            .bind(&record.theme_code)
            .bind(record.latitude)
            .bind(record.longitude)
            .bind(&record.is_free)
            .bind(&record.homepage_url)
            .bind(category_id)
            .bind(district_id)
            .bind(observed_at)
            .bind(observed_at)
            .bind(observed_at)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| {
                map_unique_violation("events", format!("{} @ {}", record.title, starts_at), err)
            })?;
        Ok(row.try_get("id")?)
    }

    async fn update_event(
        &mut self,
        id: i64,
        record: &EventRecord,
        category_id: i64,
        district_id: i64,
        observed_at: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(UPDATE_EVENT_SQL)
            .bind(&record.place)
            .bind(&record.organizer)
            .bind(&record.audience)
            .bind(&record.fee)
            .bind(&record.performers)
            .bind(&record.program)
            .bind(&record.description)
            .bind(&record.organizer_url)
            .bind(&record.image_url)
            .bind(record.registered_at)
            .bind(&record.ticket)
            .bind(record.ends_at)
            .bind(&record.theme_code)
            .bind(record.latitude)
            .bind(record.longitude)
            .bind(&record.is_free)
            .bind(&record.homepage_url)
            .bind(category_id)
            .bind(district_id)
            .bind(observed_at)
            .bind(observed_at)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing {
                entity: "events",
                id,
            });
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        Ok(self.tx.commit().await?)
    }
}

/// Id sequences in the in-memory backend start past the fixed dimension
/// rows, matching how the real store is seeded.
const MEM_FIRST_DIMENSION_ID: i64 = 1001;

#[derive(Debug, Clone)]
pub struct MemEvent {
    pub id: i64,
    pub starts_at: NaiveDateTime,
    pub record: EventRecord,
    pub category_id: i64,
    pub district_id: i64,
    pub synced_at: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
struct MemState {
    categories: HashMap<String, i64>,
    districts: HashMap<String, i64>,
    events: Vec<MemEvent>,
    next_dimension_id: i64,
    next_event_id: i64,
}

impl Default for MemState {
    fn default() -> Self {
        Self {
            categories: HashMap::new(),
            districts: HashMap::new(),
            events: Vec::new(),
            next_dimension_id: MEM_FIRST_DIMENSION_ID,
            next_event_id: 1,
        }
    }
}

impl MemState {
    fn dimension_map(&mut self, kind: DimensionKind) -> &mut HashMap<String, i64> {
        match kind {
            DimensionKind::Category => &mut self.categories,
            DimensionKind::District => &mut self.districts,
        }
    }
}

/// In-memory store with copy-on-begin transaction semantics and the same
/// uniqueness checks the relational schema enforces. Backs `--dry-run` and
/// the pipeline tests.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<MemEvent> {
        self.lock().events.clone()
    }

    pub fn dimension_id(&self, kind: DimensionKind, label: &str) -> Option<i64> {
        let mut state = self.lock();
        state.dimension_map(kind).get(label).copied()
    }

    pub fn dimension_count(&self, kind: DimensionKind) -> usize {
        let mut state = self.lock();
        state.dimension_map(kind).len()
    }
}

pub struct MemStoreTx {
    shared: Arc<Mutex<MemState>>,
    working: MemState,
}

#[async_trait]
impl SyncStore for MemStore {
    type Tx = MemStoreTx;

    async fn begin(&self) -> Result<MemStoreTx, StoreError> {
        let working = self.lock().clone();
        Ok(MemStoreTx {
            shared: Arc::clone(&self.state),
            working,
        })
    }
}

#[async_trait]
impl StoreTx for MemStoreTx {
    async fn find_dimension(
        &mut self,
        kind: DimensionKind,
        label: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self.working.dimension_map(kind).get(label).copied())
    }

    async fn insert_dimension(
        &mut self,
        kind: DimensionKind,
        label: &str,
    ) -> Result<i64, StoreError> {
        let map = self.working.dimension_map(kind);
        if map.contains_key(label) {
            return Err(StoreError::Conflict {
                entity: kind.table(),
                detail: label.to_string(),
            });
        }
        let id = self.working.next_dimension_id;
        self.working.next_dimension_id += 1;
        self.working.dimension_map(kind).insert(label.to_string(), id);
        Ok(id)
    }

    async fn find_event(
        &mut self,
        title: &str,
        starts_at: NaiveDateTime,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .working
            .events
            .iter()
            .find(|e| e.record.title == title && e.starts_at == starts_at)
            .map(|e| e.id))
    }

    async fn insert_event(
        &mut self,
        record: &EventRecord,
        starts_at: NaiveDateTime,
        category_id: i64,
        district_id: i64,
        observed_at: NaiveDateTime,
    ) -> Result<i64, StoreError> {
        if self
            .working
            .events
            .iter()
            .any(|e| e.record.title == record.title && e.starts_at == starts_at)
        {
            return Err(StoreError::Conflict {
                entity: "events",
                detail: format!("{} @ {}", record.title, starts_at),
            });
        }
        let id = self.working.next_event_id;
        self.working.next_event_id += 1;
        self.working.events.push(MemEvent {
            id,
            starts_at,
            record: record.clone(),
            category_id,
            district_id,
            synced_at: observed_at,
            created_at: observed_at,
            updated_at: observed_at,
        });
        Ok(id)
    }

    async fn update_event(
        &mut self,
        id: i64,
        record: &EventRecord,
        category_id: i64,
        district_id: i64,
        observed_at: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let event = self
            .working
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::Missing {
                entity: "events",
                id,
            })?;
        // starts_at and created_at are never rewritten on update.
        let starts_at = event.starts_at;
        event.record = record.clone();
        event.record.starts_at = Some(starts_at);
        event.category_id = category_id;
        event.district_id = district_id;
        event.synced_at = observed_at;
        event.updated_at = observed_at;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut shared = self
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *shared = self.working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use cues_core::{normalize_date, RawEvent};

    fn observed() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 5, 1)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap()
    }

    fn concert_record() -> EventRecord {
        EventRecord::from_raw(&RawEvent {
            title: Some("Spring Concert".to_string()),
            category: Some("콘서트".to_string()),
            district: Some("강남구".to_string()),
            place: Some("코엑스".to_string()),
            starts: Some("2025-05-08 00:00:00.0".to_string()),
            lot: Some("37.5111".to_string()),
            lat: Some("127.0590".to_string()),
            ..RawEvent::default()
        })
    }

    #[tokio::test]
    async fn fixed_label_resolves_without_store_access() {
        let store = MemStore::new();
        let fixed = FixedDimensions::seoul();
        let mut tx = store.begin().await.unwrap();

        let id = resolve_dimension(&mut tx, &fixed, DimensionKind::Category, Some("콘서트"))
            .await
            .unwrap();
        assert_eq!(id, 15);
        tx.commit().await.unwrap();
        assert_eq!(store.dimension_count(DimensionKind::Category), 0);
    }

    #[tokio::test]
    async fn empty_label_collapses_to_the_catch_all() {
        let store = MemStore::new();
        let fixed = FixedDimensions::seoul();
        let mut tx = store.begin().await.unwrap();

        assert_eq!(
            resolve_dimension(&mut tx, &fixed, DimensionKind::Category, None)
                .await
                .unwrap(),
            16
        );
        assert_eq!(
            resolve_dimension(&mut tx, &fixed, DimensionKind::District, Some("  "))
                .await
                .unwrap(),
            26
        );
    }

    #[tokio::test]
    async fn novel_label_is_created_once_and_reused() {
        let store = MemStore::new();
        let fixed = FixedDimensions::seoul();
        let mut tx = store.begin().await.unwrap();

        let first = resolve_dimension(&mut tx, &fixed, DimensionKind::Category, Some("미디어아트"))
            .await
            .unwrap();
        let second = resolve_dimension(&mut tx, &fixed, DimensionKind::Category, Some("미디어아트"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(first >= MEM_FIRST_DIMENSION_ID);
        tx.commit().await.unwrap();
        assert_eq!(store.dimension_count(DimensionKind::Category), 1);
        assert_eq!(
            store.dimension_id(DimensionKind::Category, "미디어아트"),
            Some(first)
        );
    }

    #[tokio::test]
    async fn apply_inserts_then_updates_the_same_row() {
        let store = MemStore::new();
        let record = concert_record();

        let mut tx = store.begin().await.unwrap();
        let (first_id, outcome) = apply_event(&mut tx, &record, 15, 1, observed())
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        tx.commit().await.unwrap();

        let later = observed() + chrono::Duration::hours(12);
        let mut updated = record.clone();
        updated.place = "예술의전당".to_string();
        let mut tx = store.begin().await.unwrap();
        let (second_id, outcome) = apply_event(&mut tx, &updated, 15, 1, later).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(first_id, second_id);
        tx.commit().await.unwrap();

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].record.place, "예술의전당");
        assert_eq!(
            Some(events[0].starts_at),
            normalize_date(Some("2025-05-08 00:00:00.0"))
        );
        assert_eq!(events[0].created_at, observed());
        assert_eq!(events[0].updated_at, later);
        assert_eq!(events[0].synced_at, later);
    }

    #[tokio::test]
    async fn missing_start_date_is_keyed_on_processing_time() {
        let store = MemStore::new();
        let record = EventRecord::from_raw(&RawEvent {
            title: Some("상시 전시".to_string()),
            ..RawEvent::default()
        });

        let mut tx = store.begin().await.unwrap();
        let (_, outcome) = apply_event(&mut tx, &record, 16, 26, observed())
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        tx.commit().await.unwrap();

        let events = store.events();
        assert_eq!(events[0].starts_at, observed());
        assert_eq!(events[0].record.latitude, 0.0);
        assert_eq!(events[0].record.longitude, 0.0);
    }

    #[tokio::test]
    async fn natural_key_rejects_a_duplicate_insert() {
        let store = MemStore::new();
        let record = concert_record();
        let starts_at = record.starts_at.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&record, starts_at, 15, 1, observed())
            .await
            .unwrap();
        let err = tx
            .insert_event(&record, starts_at, 15, 1, observed())
            .await
            .expect_err("duplicate natural key");
        assert!(matches!(err, StoreError::Conflict { entity: "events", .. }));
    }

    #[tokio::test]
    async fn duplicate_dimension_label_conflicts() {
        let store = MemStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_dimension(DimensionKind::District, "세종시").await.unwrap();
        let err = tx
            .insert_dimension(DimensionKind::District, "세종시")
            .await
            .expect_err("duplicate label");
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn uncommitted_transaction_leaves_the_store_untouched() {
        let store = MemStore::new();
        let record = concert_record();

        let mut tx = store.begin().await.unwrap();
        apply_event(&mut tx, &record, 15, 1, observed()).await.unwrap();
        assert!(store.events().is_empty());
        drop(tx);
        assert!(store.events().is_empty());

        let mut tx = store.begin().await.unwrap();
        apply_event(&mut tx, &record, 15, 1, observed()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.events().len(), 1);
    }
}
