use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};

use crate::extract::ExtractionEngine;
use crate::model::{Catalogue, CatalogueListing, Chapter, ChapterContent, ChapterFilter};
use crate::store::{ContentStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("catalogue not found: {0}")]
    CatalogueNotFound(String),

    #[error("chapter not found: {0}")]
    ChapterNotFound(String),

    #[error("group {group} not found in catalogue {catalogue}")]
    GroupNotFound { catalogue: String, group: String },

    #[error("compute chapter size: {0}")]
    Size(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryEvent {
    ChapterUpdated {
        catalogue_url: String,
        chapter_url: String,
    },
    CatalogueUpdated {
        catalogue_url: String,
    },
}

#[derive(Debug, Clone, Copy)]
enum CatalogueEffect {
    None,
    Read(DateTime<Utc>),
    Unread,
}

/// Keeps chapters and the denormalized copies inside their catalogues in step.
///
/// Every chapter mutation persists the chapter, reloads the owning catalogue,
/// replaces its copy, applies catalogue side effects and persists the
/// catalogue. Writes to one catalogue are serialized inside this process;
/// across processes the last catalogue write wins.
pub struct Library {
    store: Arc<ContentStore>,
    events: broadcast::Sender<LibraryEvent>,
    catalogue_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Library {
    pub fn new(store: Arc<ContentStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            events,
            catalogue_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    pub async fn catalogue(&self, url: &str) -> Result<Option<Catalogue>, LibraryError> {
        Ok(self.store.fetch(url).await?)
    }

    pub async fn catalogues(&self) -> Result<Vec<Catalogue>, LibraryError> {
        let mut catalogues: Vec<Catalogue> = self.store.fetch_all().await?;
        catalogues.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(catalogues)
    }

    pub async fn chapter(&self, url: &str) -> Result<Option<Chapter>, LibraryError> {
        Ok(self.store.fetch(url).await?)
    }

    pub async fn mark_as_read(&self, chapter_url: &str) -> Result<Chapter, LibraryError> {
        let now = Utc::now();
        self.mutate(chapter_url, CatalogueEffect::Read(now), |chapter| {
            chapter.mark_read(now);
            Ok(())
        })
        .await
    }

    pub async fn mark_as_unread(&self, chapter_url: &str) -> Result<Chapter, LibraryError> {
        self.mutate(chapter_url, CatalogueEffect::Unread, |chapter| {
            chapter.mark_unread();
            Ok(())
        })
        .await
    }

    /// Drops the downloaded payload; the chapter stays listed in its catalogue.
    pub async fn delete_chapter(&self, chapter_url: &str) -> Result<Chapter, LibraryError> {
        self.mutate(chapter_url, CatalogueEffect::None, |chapter| {
            chapter.clear_download();
            Ok(())
        })
        .await
    }

    /// Attaches freshly fetched markup and its extraction to the stored
    /// chapter. Read state is taken from the store, not from the caller.
    pub async fn store_download(
        &self,
        chapter_url: &str,
        raw_markup: String,
        content: ChapterContent,
    ) -> Result<Chapter, LibraryError> {
        self.mutate(chapter_url, CatalogueEffect::None, move |chapter| {
            chapter.set_downloaded(raw_markup, content)?;
            Ok(())
        })
        .await
    }

    /// Folds a remote listing into the catalogue, creating it when absent.
    ///
    /// Chapters seen for the first time get the next sequence ids in listing
    /// order and are persisted without markup. Known chapters keep their ids,
    /// state and content.
    pub async fn merge_listing(
        &self,
        catalogue_url: &str,
        listing: &CatalogueListing,
    ) -> Result<Catalogue, LibraryError> {
        let lock = self.catalogue_lock(catalogue_url).await;
        let _guard = lock.lock().await;

        let mut catalogue = self
            .store
            .fetch::<Catalogue>(catalogue_url)
            .await?
            .unwrap_or_else(|| Catalogue::new(catalogue_url));
        if listing.title.is_some() {
            catalogue.title.clone_from(&listing.title);
        }

        let mut created = 0usize;
        for listed in &listing.chapters {
            if catalogue.contains(&listed.url) {
                continue;
            }
            let chapter = Chapter::new(
                catalogue_url,
                listed.url.as_str(),
                catalogue.next_sequence_id(),
                listed.name.as_str(),
                listed.group.as_str(),
            );
            self.store.save(&chapter).await?;
            catalogue.upsert_chapter(&chapter);
            created += 1;
        }

        catalogue.touch();
        self.store.save(&catalogue).await?;
        tracing::info!(
            catalogue = %catalogue_url,
            created,
            total = catalogue.len(),
            "merged catalogue listing"
        );
        self.emit(LibraryEvent::CatalogueUpdated {
            catalogue_url: catalogue_url.to_owned(),
        });
        Ok(catalogue)
    }

    pub async fn set_group_enabled(
        &self,
        catalogue_url: &str,
        group: &str,
        enabled: bool,
    ) -> Result<Catalogue, LibraryError> {
        let lock = self.catalogue_lock(catalogue_url).await;
        let _guard = lock.lock().await;

        let mut catalogue = self.require_catalogue(catalogue_url).await?;
        if !catalogue.set_group_enabled(group, enabled) {
            return Err(LibraryError::GroupNotFound {
                catalogue: catalogue_url.to_owned(),
                group: group.to_owned(),
            });
        }
        catalogue.touch();
        self.store.save(&catalogue).await?;
        self.emit(LibraryEvent::CatalogueUpdated {
            catalogue_url: catalogue_url.to_owned(),
        });
        Ok(catalogue)
    }

    /// Full chapters in catalogue order. A chapter listed in the catalogue but
    /// missing from the store is a [`LibraryError::ChapterNotFound`].
    pub async fn load_chapters(
        &self,
        catalogue_url: &str,
        filter: ChapterFilter,
    ) -> Result<Vec<Chapter>, LibraryError> {
        let catalogue = self.require_catalogue(catalogue_url).await?;
        let mut out = Vec::new();
        for summary in catalogue.chapters_matching(filter) {
            out.push(self.require_chapter(&summary.url).await?);
        }
        Ok(out)
    }

    /// Runs extraction again over retained markup of downloaded chapters.
    pub async fn reextract(
        &self,
        catalogue_url: &str,
        engine: &ExtractionEngine,
    ) -> Result<usize, LibraryError> {
        let urls = self
            .require_catalogue(catalogue_url)
            .await?
            .chapters_matching(ChapterFilter::Downloaded)
            .into_iter()
            .map(|summary| summary.url.clone())
            .collect::<Vec<_>>();

        let mut updated = 0usize;
        for url in urls {
            let mut reextracted = false;
            self.mutate(&url, CatalogueEffect::None, |chapter| {
                if let Some(markup) = chapter.raw_markup.take() {
                    let extraction = engine.extract(&markup, &chapter.url);
                    chapter.set_downloaded(markup, extraction.content)?;
                    reextracted = true;
                }
                Ok(())
            })
            .await?;
            if reextracted {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Read-modify-write of one chapter and its catalogue copy.
    ///
    /// The chapter is reloaded under the catalogue lock, so mutations made
    /// in this process never write back a stale snapshot.
    async fn mutate<F>(
        &self,
        chapter_url: &str,
        effect: CatalogueEffect,
        apply: F,
    ) -> Result<Chapter, LibraryError>
    where
        F: FnOnce(&mut Chapter) -> Result<(), LibraryError>,
    {
        let catalogue_url = self.require_chapter(chapter_url).await?.catalogue_url;
        let lock = self.catalogue_lock(&catalogue_url).await;
        let _guard = lock.lock().await;

        let mut chapter = self.require_chapter(chapter_url).await?;
        apply(&mut chapter)?;
        self.store.save(&chapter).await?;

        let mut catalogue = self.require_catalogue(&catalogue_url).await?;
        catalogue.upsert_chapter(&chapter);
        match effect {
            CatalogueEffect::None => {}
            CatalogueEffect::Read(at) => {
                catalogue.last_read_chapter = Some(chapter.url.clone());
                catalogue.last_read_at = Some(at);
            }
            CatalogueEffect::Unread => {
                if catalogue.last_read_chapter.as_deref() == Some(chapter.url.as_str()) {
                    let replacement = catalogue
                        .most_recently_read()
                        .map(|c| (c.url.clone(), c.last_read_at));
                    match replacement {
                        Some((url, at)) => {
                            catalogue.last_read_chapter = Some(url);
                            catalogue.last_read_at = at;
                        }
                        None => {
                            catalogue.last_read_chapter = None;
                            catalogue.last_read_at = None;
                        }
                    }
                }
            }
        }
        catalogue.touch();
        self.store.save(&catalogue).await?;

        self.emit(LibraryEvent::ChapterUpdated {
            catalogue_url: chapter.catalogue_url.clone(),
            chapter_url: chapter.url.clone(),
        });
        Ok(chapter)
    }

    async fn require_chapter(&self, url: &str) -> Result<Chapter, LibraryError> {
        self.store
            .fetch(url)
            .await?
            .ok_or_else(|| LibraryError::ChapterNotFound(url.to_owned()))
    }

    async fn require_catalogue(&self, url: &str) -> Result<Catalogue, LibraryError> {
        self.store
            .fetch(url)
            .await?
            .ok_or_else(|| LibraryError::CatalogueNotFound(url.to_owned()))
    }

    async fn catalogue_lock(&self, url: &str) -> Arc<Mutex<()>> {
        let mut locks = self.catalogue_locks.lock().await;
        Arc::clone(locks.entry(url.to_owned()).or_default())
    }

    fn emit(&self, event: LibraryEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}
