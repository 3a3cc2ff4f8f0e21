use std::sync::{
    Arc, LazyLock,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ConnectionTrait, DbConn, DbErr, EntityTrait, RuntimeErr,
    SqlErr, Statement, Value,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{config::db_conn_capsule, orm::paste};

pub const MAX_PASTE_ID_LEN: usize = 32;

const CREATE_PASTES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS pastes (
    id VARCHAR(32) PRIMARY KEY,
    content TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at TIMESTAMPTZ,
    max_views INTEGER CHECK (max_views >= 1),
    views_used INTEGER NOT NULL DEFAULT 0 CHECK (views_used >= 0),
    CHECK (views_used <= max_views)
)";

const PASTE_COLUMNS: &str = "id, content, created_at, expires_at, max_views, views_used";

/// SQL form of [`Paste::is_available_at`], with `now` as the placeholder for the current time.
/// Every statement that filters on availability is built from this one definition.
fn available_at(now: &str) -> String {
    format!(
        "(expires_at IS NULL OR expires_at > {now}) \
         AND (max_views IS NULL OR views_used < max_views)"
    )
}

static FETCH_READ_ONLY_SQL: LazyLock<String> = LazyLock::new(|| {
    format!(
        "SELECT {PASTE_COLUMNS} FROM pastes WHERE id = $1 AND {}",
        available_at("$2")
    )
});

// NOTE: check and increment must stay one statement; the store serializes
// concurrent updates to the row and re-evaluates the guard for each of them.
static FETCH_AND_CONSUME_SQL: LazyLock<String> = LazyLock::new(|| {
    format!(
        "UPDATE pastes SET views_used = views_used + 1 WHERE id = $1 AND {} \
         RETURNING {PASTE_COLUMNS}",
        available_at("$2")
    )
});

static DELETE_UNAVAILABLE_SQL: LazyLock<String> = LazyLock::new(|| {
    format!(
        "DELETE FROM pastes WHERE NOT ({})",
        available_at("$1")
    )
});

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PasteId(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PasteIdValidationError {
    #[error("paste ID is empty")]
    Empty,
    #[error("paste ID is longer than {MAX_PASTE_ID_LEN} characters")]
    TooLong,
    #[error("paste ID contains invalid characters: {invalid_chars}")]
    InvalidCharacters { invalid_chars: String },
}

impl PasteId {
    /// # Errors
    /// Will return [`Err`] if `id` is empty, too long, or not ASCII alphanumeric.
    pub fn new(id: String) -> Result<Self, PasteIdValidationError> {
        if id.is_empty() {
            return Err(PasteIdValidationError::Empty);
        }
        if id.len() > MAX_PASTE_ID_LEN {
            return Err(PasteIdValidationError::TooLong);
        }

        let invalid_chars: String = id.chars().filter(|c| !c.is_ascii_alphanumeric()).collect();
        if invalid_chars.is_empty() {
            Ok(Self(id))
        } else {
            Err(PasteIdValidationError::InvalidCharacters { invalid_chars })
        }
    }

    /// A fresh, content-independent ID: the base62 form of a random UUID.
    #[must_use]
    pub fn generate() -> Self {
        Self(base62::encode(Uuid::new_v4().as_u128()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paste {
    pub id: PasteId,
    pub content: String,
    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub max_views: Option<u32>,
    pub views_used: u32,
}

impl Paste {
    /// A paste that expires exactly at `now` is already expired.
    #[must_use]
    pub fn is_available_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
            && self
                .max_views
                .is_none_or(|max_views| self.views_used < max_views)
    }

    /// [`None`] when the paste has no view limit.
    #[must_use]
    pub fn remaining_views(&self) -> Option<u32> {
        self.max_views
            .map(|max_views| max_views.saturating_sub(self.views_used))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPaste {
    pub id: PasteId,
    pub content: String,
    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub max_views: Option<u32>,
}

#[derive(Debug, Error)]
pub enum SavePasteError {
    #[error("paste ID is already taken")]
    DuplicateId,
    #[error("paste store is unavailable: {0}")]
    Unavailable(anyhow::Error),
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("paste store is unavailable: {0}")]
    Unavailable(anyhow::Error),
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

fn is_unavailable(err: &DbErr) -> bool {
    matches!(err, DbErr::ConnectionAcquire(_) | DbErr::Conn(_))
}

const UNIQUE_VIOLATION_SQLSTATE: &str = "23505";

fn is_unique_violation(err: &DbErr) -> bool {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return true;
    }
    // NOTE: sql_err only recognizes driver-native error types, so fall back to the SQLSTATE
    match err {
        DbErr::Exec(RuntimeErr::SqlxError(err)) | DbErr::Query(RuntimeErr::SqlxError(err)) => err
            .as_database_error()
            .and_then(|err| err.code())
            .is_some_and(|code| code == UNIQUE_VIOLATION_SQLSTATE),
        _ => false,
    }
}

impl From<DbErr> for StoreError {
    fn from(err: DbErr) -> Self {
        if is_unavailable(&err) {
            Self::Unavailable(err.into())
        } else {
            Self::Internal(err.into())
        }
    }
}

impl From<DbErr> for SavePasteError {
    fn from(err: DbErr) -> Self {
        if is_unique_violation(&err) {
            Self::DuplicateId
        } else if is_unavailable(&err) {
            Self::Unavailable(err.into())
        } else {
            Self::Internal(err.into())
        }
    }
}

impl TryFrom<paste::Model> for Paste {
    type Error = anyhow::Error;

    fn try_from(
        paste::Model {
            id,
            content,
            created_at,
            expires_at,
            max_views,
            views_used,
        }: paste::Model,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            id: PasteId::new(id).context("Stored paste has an invalid ID")?,
            content,
            created_at,
            expires_at,
            max_views: max_views
                .map(u32::try_from)
                .transpose()
                .context("Stored paste has a negative max_views")?,
            views_used: u32::try_from(views_used)
                .context("Stored paste has a negative views_used")?,
        })
    }
}

pub fn paste_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn PasteRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(PasteRepositoryImpl::new(db))
}

#[async_trait]
pub trait PasteRepository: Send + Sync {
    /// Inserts a paste with no views used.
    async fn create_paste(&self, paste: NewPaste) -> Result<(), SavePasteError>;

    /// Returns the paste iff it is available at `now`, without counting a view.
    async fn fetch_read_only(
        &self,
        id: &PasteId,
        now: OffsetDateTime,
    ) -> Result<Option<Paste>, StoreError>;

    /// Atomically counts one view of the paste iff it is available at `now`,
    /// returning the paste as it is after the increment.
    async fn fetch_and_consume(
        &self,
        id: &PasteId,
        now: OffsetDateTime,
    ) -> Result<Option<Paste>, StoreError>;

    /// Ensures the schema exists and the store answers.
    async fn check_health(&self) -> Result<(), StoreError>;

    /// Deletes every paste unavailable at `now`, returning how many were deleted.
    async fn delete_unavailable_pastes(&self, now: OffsetDateTime) -> Result<u64, StoreError>;
}

struct PasteRepositoryImpl {
    db: DbConn,
    schema_ready: AtomicBool,
}

impl PasteRepositoryImpl {
    const fn new(db: DbConn) -> Self {
        Self {
            db,
            schema_ready: AtomicBool::new(false),
        }
    }

    // NOTE: racing callers may both run the DDL; it is idempotent.
    async fn ensure_schema(&self) -> Result<(), DbErr> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        self.db.execute_unprepared(CREATE_PASTES_TABLE_SQL).await?;
        self.schema_ready.store(true, Ordering::Release);
        info!("Ensured pastes table exists");
        Ok(())
    }

    async fn query_pastes(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Paste>, StoreError> {
        self.ensure_schema().await?;

        let stmt = Statement::from_sql_and_values(self.db.get_database_backend(), sql, values);
        paste::Entity::find()
            .from_raw_sql(stmt)
            .all(&self.db)
            .await?
            .into_iter()
            .map(Paste::try_from)
            .collect::<anyhow::Result<_>>()
            .map_err(StoreError::Internal)
    }

    async fn query_paste_by_id(
        &self,
        sql: &str,
        id: &PasteId,
        now: OffsetDateTime,
    ) -> Result<Option<Paste>, StoreError> {
        let mut pastes = self
            .query_pastes(sql, vec![Value::from(id.as_str()), Value::from(now)])
            .await?;
        match pastes.len() {
            0 | 1 => Ok(pastes.pop()),
            n => Err(StoreError::Internal(anyhow!(
                "Primary key lookup returned {n} rows"
            ))),
        }
    }
}

#[async_trait]
impl PasteRepository for PasteRepositoryImpl {
    #[instrument(skip(self, paste), fields(id = paste.id.as_str()))]
    async fn create_paste(&self, paste: NewPaste) -> Result<(), SavePasteError> {
        self.ensure_schema().await?;

        let max_views = paste
            .max_views
            .map(i32::try_from)
            .transpose()
            .context("max_views does not fit in the store")
            .map_err(SavePasteError::Internal)?;
        let to_insert = paste::ActiveModel {
            id: Set(paste.id.into_inner()),
            content: Set(paste.content),
            created_at: Set(paste.created_at),
            expires_at: Set(paste.expires_at),
            max_views: Set(max_views),
            views_used: Set(0),
        };
        to_insert.insert(&self.db).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_read_only(
        &self,
        id: &PasteId,
        now: OffsetDateTime,
    ) -> Result<Option<Paste>, StoreError> {
        self.query_paste_by_id(&FETCH_READ_ONLY_SQL, id, now).await
    }

    #[instrument(skip(self))]
    async fn fetch_and_consume(
        &self,
        id: &PasteId,
        now: OffsetDateTime,
    ) -> Result<Option<Paste>, StoreError> {
        self.query_paste_by_id(&FETCH_AND_CONSUME_SQL, id, now).await
    }

    #[instrument(skip(self))]
    async fn check_health(&self) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        self.db.ping().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_unavailable_pastes(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        self.ensure_schema().await?;

        let stmt = Statement::from_sql_and_values(
            self.db.get_database_backend(),
            DELETE_UNAVAILABLE_SQL.as_str(),
            [Value::from(now)],
        );
        Ok(self.db.execute_raw(stmt).await?.rows_affected())
    }
}
