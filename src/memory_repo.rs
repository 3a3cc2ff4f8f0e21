use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Mutex, MutexGuard},
};

use anyhow::anyhow;
use async_trait::async_trait;
use time::OffsetDateTime;

use crate::paste_repo::{
    NewPaste, Paste, PasteId, PasteRepository, SavePasteError, StoreError,
};

/// A [`PasteRepository`] held in process memory, where the mutex plays the
/// role of the store's row lock.
#[derive(Default)]
pub struct MemoryPasteRepository {
    pastes: Mutex<HashMap<PasteId, Paste>>,
}

impl MemoryPasteRepository {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<PasteId, Paste>>, StoreError> {
        self.pastes
            .lock()
            .map_err(|_| StoreError::Internal(anyhow!("Paste map lock was poisoned")))
    }

    pub fn views_used(&self, id: &PasteId) -> Option<u32> {
        self.lock().ok()?.get(id).map(|paste| paste.views_used)
    }
}

#[async_trait]
impl PasteRepository for MemoryPasteRepository {
    async fn create_paste(&self, paste: NewPaste) -> Result<(), SavePasteError> {
        let mut pastes = self.lock().map_err(|err| match err {
            StoreError::Unavailable(err) => SavePasteError::Unavailable(err),
            StoreError::Internal(err) => SavePasteError::Internal(err),
        })?;
        match pastes.entry(paste.id.clone()) {
            Entry::Occupied(_) => Err(SavePasteError::DuplicateId),
            Entry::Vacant(entry) => {
                entry.insert(Paste {
                    id: paste.id,
                    content: paste.content,
                    created_at: paste.created_at,
                    expires_at: paste.expires_at,
                    max_views: paste.max_views,
                    views_used: 0,
                });
                Ok(())
            }
        }
    }

    async fn fetch_read_only(
        &self,
        id: &PasteId,
        now: OffsetDateTime,
    ) -> Result<Option<Paste>, StoreError> {
        Ok(self
            .lock()?
            .get(id)
            .filter(|paste| paste.is_available_at(now))
            .cloned())
    }

    async fn fetch_and_consume(
        &self,
        id: &PasteId,
        now: OffsetDateTime,
    ) -> Result<Option<Paste>, StoreError> {
        Ok(self
            .lock()?
            .get_mut(id)
            .filter(|paste| paste.is_available_at(now))
            .map(|paste| {
                paste.views_used += 1;
                paste.clone()
            }))
    }

    async fn check_health(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }

    async fn delete_unavailable_pastes(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let mut pastes = self.lock()?;
        let before = pastes.len();
        pastes.retain(|_, paste| paste.is_available_at(now));
        Ok((before - pastes.len()) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use time::{Duration, macros::datetime};

    use super::*;

    const NOW: OffsetDateTime = datetime!(2025-06-01 12:00:00 UTC);

    async fn insert(
        repo: &MemoryPasteRepository,
        expires_at: Option<OffsetDateTime>,
        max_views: Option<u32>,
    ) -> PasteId {
        let id = PasteId::generate();
        repo.create_paste(NewPaste {
            id: id.clone(),
            content: "text".to_owned(),
            created_at: NOW,
            expires_at,
            max_views,
        })
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let repo = MemoryPasteRepository::default();
        let id = insert(&repo, None, None).await;
        let err = repo
            .create_paste(NewPaste {
                id,
                content: "other".to_owned(),
                created_at: NOW,
                expires_at: None,
                max_views: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SavePasteError::DuplicateId));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_exceed_max_views() {
        const MAX_VIEWS: u32 = 5;
        const CONSUMERS: usize = 64;

        let repo = Arc::new(MemoryPasteRepository::default());
        let id = insert(&repo, None, Some(MAX_VIEWS)).await;

        let handles: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let repo = Arc::clone(&repo);
                let id = id.clone();
                tokio::spawn(async move { repo.fetch_and_consume(&id, NOW).await.unwrap() })
            })
            .collect();

        let mut successes = Vec::new();
        for handle in handles {
            if let Some(paste) = handle.await.unwrap() {
                successes.push(paste.views_used);
            }
        }

        successes.sort_unstable();
        assert_eq!(successes, (1..=MAX_VIEWS).collect::<Vec<_>>());
        assert_eq!(repo.views_used(&id), Some(MAX_VIEWS));
    }

    #[tokio::test]
    async fn test_exhausted_paste_is_not_found_read_only() {
        let repo = MemoryPasteRepository::default();
        let id = insert(&repo, None, Some(1)).await;

        assert!(repo.fetch_read_only(&id, NOW).await.unwrap().is_some());
        assert!(repo.fetch_and_consume(&id, NOW).await.unwrap().is_some());
        assert!(repo.fetch_read_only(&id, NOW).await.unwrap().is_none());
        assert!(repo.fetch_and_consume(&id, NOW).await.unwrap().is_none());
        assert_eq!(repo.views_used(&id), Some(1));
    }

    #[tokio::test]
    async fn test_expired_paste_is_not_consumed() {
        let repo = MemoryPasteRepository::default();
        let expires_at = NOW + Duration::seconds(1);
        let id = insert(&repo, Some(expires_at), Some(3)).await;

        assert!(repo.fetch_and_consume(&id, expires_at).await.unwrap().is_none());
        assert!(repo.fetch_read_only(&id, expires_at).await.unwrap().is_none());
        assert_eq!(repo.views_used(&id), Some(0));
    }

    #[tokio::test]
    async fn test_delete_unavailable_pastes() {
        let repo = MemoryPasteRepository::default();
        let kept = insert(&repo, Some(NOW + Duration::hours(1)), None).await;
        let expired = insert(&repo, Some(NOW), None).await;
        let exhausted = insert(&repo, None, Some(1)).await;
        repo.fetch_and_consume(&exhausted, NOW).await.unwrap();

        assert_eq!(repo.delete_unavailable_pastes(NOW).await.unwrap(), 2);
        assert_eq!(repo.views_used(&kept), Some(0));
        assert_eq!(repo.views_used(&expired), None);
        assert_eq!(repo.views_used(&exhausted), None);
    }
}
