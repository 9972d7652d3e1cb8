//! Pinned stories kept for offline viewing, keyed by remote story id.

use crate::core::{Result, SavedStory};
use crate::storage::{Record, RecordKey, SAVED_COLLECTION, StoreHandle};
use std::str::FromStr;

impl Record for SavedStory {
    fn key(&self) -> Option<RecordKey> {
        Some(RecordKey::Name(self.id.clone()))
    }

    fn assign_key(&mut self, _key: RecordKey) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationFilter {
    #[default]
    All,
    WithLocation,
    WithoutLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavedSort {
    #[default]
    Newest,
    Oldest,
    Name,
}

impl FromStr for LocationFilter {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "with-location" | "withLoc" => Ok(Self::WithLocation),
            "without-location" | "noLoc" => Ok(Self::WithoutLocation),
            other => Err(format!("unknown location filter '{}'", other)),
        }
    }
}

impl FromStr for SavedSort {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "newest" => Ok(Self::Newest),
            "oldest" => Ok(Self::Oldest),
            "name" => Ok(Self::Name),
            other => Err(format!("unknown sort order '{}'", other)),
        }
    }
}

/// View parameters for the saved list.
#[derive(Debug, Clone, Default)]
pub struct SavedQuery {
    pub text: String,
    pub filter: LocationFilter,
    pub sort: SavedSort,
}

impl SavedQuery {
    pub fn apply(&self, mut items: Vec<SavedStory>) -> Vec<SavedStory> {
        match self.filter {
            LocationFilter::All => {}
            LocationFilter::WithLocation => items.retain(|s| s.location().is_some()),
            LocationFilter::WithoutLocation => items.retain(|s| s.location().is_none()),
        }

        let needle = self.text.trim().to_lowercase();
        if !needle.is_empty() {
            items.retain(|s| {
                s.name.to_lowercase().contains(&needle)
                    || s.description.to_lowercase().contains(&needle)
            });
        }

        match self.sort {
            SavedSort::Newest => items.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            SavedSort::Oldest => items.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            SavedSort::Name => items.sort_by(|a, b| a.name.cmp(&b.name)),
        }
        items
    }
}

#[derive(Clone)]
pub struct SavedStories {
    store: StoreHandle,
}

impl SavedStories {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Saves or overwrites the pinned copy of a story.
    pub async fn save(&self, story: SavedStory) -> Result<()> {
        self.store
            .store()
            .await?
            .put(SAVED_COLLECTION, story)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SavedStory>> {
        self.store
            .store()
            .await?
            .get(SAVED_COLLECTION, &RecordKey::from(id))
            .await
    }

    pub async fn list(&self, query: &SavedQuery) -> Result<Vec<SavedStory>> {
        let all = self
            .store
            .store()
            .await?
            .get_all(SAVED_COLLECTION)
            .await?;
        Ok(query.apply(all))
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store
            .store()
            .await?
            .delete(SAVED_COLLECTION, &RecordKey::from(id))
            .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.store().await?.clear(SAVED_COLLECTION).await
    }
}
