use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use rearch::CapsuleHandle;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{error, info, instrument, warn};
use url::Url;
use validator::{Validate, ValidationErrors};

use crate::{
    config::base_url_capsule,
    paste_repo::{
        NewPaste, Paste, PasteId, PasteRepository, SavePasteError, StoreError,
        paste_repository_capsule,
    },
};

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePastePayload {
    // NOTE: defaulted so a missing field gets the same message as an empty one
    #[serde(default)]
    #[validate(length(min = 1, message = "content is required and must be non-empty"))]
    pub content: String,
    #[validate(range(min = 1, message = "ttl_seconds must be an integer >= 1"))]
    pub ttl_seconds: Option<i64>,
    #[validate(range(min = 1, message = "max_views must be an integer >= 1"))]
    pub max_views: Option<i32>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CreatedPaste {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PasteView {
    pub content: String,
    pub remaining_views: Option<u32>,
    /// Timestamp in RFC 3339 format
    pub expires_at: Option<String>,
}

pub fn paste_rest_service_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn PasteRestService> {
    let paste_repo = Arc::clone(get.as_ref(paste_repository_capsule));
    let base_url = get.as_ref(base_url_capsule).clone();
    Arc::new(PasteRestServiceImpl::new(paste_repo, base_url))
}

#[async_trait]
pub trait PasteRestService: Send + Sync {
    async fn create_paste(
        &self,
        payload: CreatePastePayload,
        now: OffsetDateTime,
    ) -> Result<CreatedPaste, CreatePasteError>;

    /// Counts one view of the paste.
    async fn consume_paste(&self, id: &str, now: OffsetDateTime)
    -> Result<PasteView, GetPasteError>;

    /// Looks at the paste without counting a view.
    async fn view_paste(&self, id: &str, now: OffsetDateTime) -> Result<Paste, GetPasteError>;

    async fn check_health(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum CreatePasteError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("paste store is unavailable: {0}")]
    StoreUnavailable(anyhow::Error),
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

impl From<ValidationErrors> for CreatePasteError {
    fn from(errors: ValidationErrors) -> Self {
        let mut details: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, field_errors)| {
                field_errors.iter().map(move |err| {
                    err.message
                        .as_ref()
                        .map_or_else(|| format!("{field} is invalid"), ToString::to_string)
                })
            })
            .collect();
        details.sort();
        Self::InvalidInput(details.join("; "))
    }
}

/// Absent, expired and exhausted pastes are all [`GetPasteError::NotFound`].
#[derive(Debug, Error)]
pub enum GetPasteError {
    #[error("paste not found")]
    NotFound,
    #[error("paste store is unavailable: {0}")]
    StoreUnavailable(anyhow::Error),
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

impl From<StoreError> for GetPasteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(err) => Self::StoreUnavailable(err),
            StoreError::Internal(err) => Self::Internal(err),
        }
    }
}

pub(crate) struct PasteRestServiceImpl {
    paste_repo: Arc<dyn PasteRepository>,
    base_url: Url,
}

impl PasteRestServiceImpl {
    pub(crate) fn new(paste_repo: Arc<dyn PasteRepository>, base_url: Url) -> Self {
        Self {
            paste_repo,
            base_url,
        }
    }

    fn created_paste(&self, id: PasteId) -> Result<CreatedPaste, CreatePasteError> {
        let url = self
            .base_url
            .join(&format!("p/{}", id.as_str()))
            .context("Failed to build paste URL")
            .map_err(CreatePasteError::Internal)?;
        Ok(CreatedPaste {
            id: id.into_inner(),
            url: url.into(),
        })
    }
}

// NOTE: expiry must stay representable in RFC 3339, or every later read would fail to format it
fn expiry_after(now: OffsetDateTime, ttl_seconds: i64) -> Result<OffsetDateTime, CreatePasteError> {
    now.checked_add(Duration::seconds(ttl_seconds))
        .filter(|expires_at| expires_at.format(&Rfc3339).is_ok())
        .ok_or_else(|| CreatePasteError::InvalidInput("ttl_seconds is too large".to_owned()))
}

#[async_trait]
impl PasteRestService for PasteRestServiceImpl {
    #[instrument(skip(self, payload), fields(content_len = payload.content.len()))]
    async fn create_paste(
        &self,
        payload: CreatePastePayload,
        now: OffsetDateTime,
    ) -> Result<CreatedPaste, CreatePasteError> {
        const SAVE_ATTEMPTS: usize = 3;

        payload.validate()?;
        let CreatePastePayload {
            content,
            ttl_seconds,
            max_views,
        } = payload;

        let expires_at = ttl_seconds
            .map(|ttl_seconds| expiry_after(now, ttl_seconds))
            .transpose()?;
        // NOTE: validated to be positive above
        let max_views = max_views.map(i32::unsigned_abs);

        for _ in 0..SAVE_ATTEMPTS {
            let id = PasteId::generate();
            let to_save = NewPaste {
                id: id.clone(),
                content: content.clone(),
                created_at: now,
                expires_at,
                max_views,
            };

            match self.paste_repo.create_paste(to_save).await {
                Ok(()) => {
                    info!(id = id.as_str(), "Created paste");
                    return self.created_paste(id);
                }
                Err(SavePasteError::Unavailable(err)) => {
                    return Err(CreatePasteError::StoreUnavailable(err));
                }
                Err(SavePasteError::Internal(err)) => {
                    error!(?err, "Encountered internal error while saving paste");
                    return Err(CreatePasteError::Internal(
                        err.context("Encountered internal error while saving paste"),
                    ));
                }
                // NOTE: the only retryable error; a fresh ID should not collide
                Err(SavePasteError::DuplicateId) => {
                    warn!(?id, "Generated paste ID that was already taken");
                }
            }
        }

        Err(CreatePasteError::Internal(anyhow!("Exhausted retry attempts")))
    }

    #[instrument(skip(self))]
    async fn consume_paste(
        &self,
        id: &str,
        now: OffsetDateTime,
    ) -> Result<PasteView, GetPasteError> {
        let Ok(id) = PasteId::new(id.to_owned()) else {
            return Err(GetPasteError::NotFound);
        };

        match self.paste_repo.fetch_and_consume(&id, now).await? {
            Some(paste) => paste.try_into().map_err(GetPasteError::Internal),
            None => Err(GetPasteError::NotFound),
        }
    }

    #[instrument(skip(self))]
    async fn view_paste(&self, id: &str, now: OffsetDateTime) -> Result<Paste, GetPasteError> {
        let Ok(id) = PasteId::new(id.to_owned()) else {
            return Err(GetPasteError::NotFound);
        };

        self.paste_repo
            .fetch_read_only(&id, now)
            .await?
            .ok_or(GetPasteError::NotFound)
    }

    #[instrument(skip(self))]
    async fn check_health(&self) -> anyhow::Result<()> {
        self.paste_repo
            .check_health()
            .await
            .context("Paste store failed its health check")
    }
}

impl TryFrom<Paste> for PasteView {
    type Error = anyhow::Error;

    fn try_from(paste: Paste) -> Result<Self, Self::Error> {
        let remaining_views = paste.remaining_views();
        Ok(Self {
            content: paste.content,
            remaining_views,
            expires_at: paste
                .expires_at
                .map(|expires_at| expires_at.format(&Rfc3339))
                .transpose()
                .context("Failed to format expiration timestamp")?,
        })
    }
}
