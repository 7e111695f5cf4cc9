//! Favorite-relation loader
//!
//! Answers "does user U favorite article A" through the adaptive
//! [`BatchLoader`], so bursts of per-article checks on a feed page collapse
//! into one bulk query per batch window.
//!
//! ## Cache keys
//!
//! - L2: `{namespace}:favorite:entity={article_id}:owner={user_id}`

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::batch_loader::{BatchLoader, BulkSource, LoaderAdmin, RelationPair};
use crate::{BatchConfig, CacheError, KeyValueCache};

/// Trait for querying favorite rows from the primary store.
///
/// Implementations can use Postgres, HTTP, or any other data source.
#[async_trait]
pub trait FavoriteSource: Send + Sync + 'static {
    /// Of `article_ids`, return the subset the user has favorited.
    async fn favorites_of(
        &self,
        user_id: &str,
        article_ids: &[String],
    ) -> Result<HashSet<String>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Adapter from FavoriteSource to the generic BulkSource trait.
///
/// Groups the window's pairs per owner and issues one query per owner in the
/// batch, unioning the results back into pair form.
struct FavoriteBatches<B: FavoriteSource> {
    backend: Arc<B>,
}

#[async_trait]
impl<B: FavoriteSource> BulkSource for FavoriteBatches<B> {
    async fn fetch_batch(
        &self,
        pairs: &[RelationPair],
    ) -> Result<HashSet<RelationPair>, Box<dyn std::error::Error + Send + Sync>> {
        let mut by_owner: HashMap<&str, Vec<String>> = HashMap::new();
        for (owner, entity) in pairs {
            by_owner.entry(owner.as_str()).or_default().push(entity.clone());
        }

        let mut held = HashSet::new();
        for (owner, article_ids) in by_owner {
            let favorites = self.backend.favorites_of(owner, &article_ids).await?;
            for article_id in favorites {
                held.insert((owner.to_owned(), article_id));
            }
        }
        Ok(held)
    }
}

/// Two-tier cached favorite lookups over a pluggable source.
pub struct FavoriteLoader<B: FavoriteSource> {
    loader: BatchLoader<FavoriteBatches<B>>,
}

impl<B: FavoriteSource> Clone for FavoriteLoader<B> {
    fn clone(&self) -> Self {
        Self {
            loader: self.loader.clone(),
        }
    }
}

impl<B: FavoriteSource> FavoriteLoader<B> {
    pub fn new(backend: B, kv: Arc<KeyValueCache>, config: BatchConfig) -> Self {
        let loader = BatchLoader::new(
            "favorite",
            FavoriteBatches {
                backend: Arc::new(backend),
            },
            kv,
            config,
        );
        Self { loader }
    }

    /// Whether the user has favorited the article.
    pub async fn is_favorite(&self, user_id: &str, article_id: &str) -> Result<bool, CacheError> {
        self.loader.load(user_id, article_id).await
    }

    /// Invalidate one relation after the user toggles it.
    pub async fn invalidate(&self, user_id: &str, article_id: &str) {
        self.loader.invalidate(user_id, article_id).await;
    }

    /// Handle for the metrics endpoint and the memory optimizer.
    pub fn admin(&self) -> Arc<dyn LoaderAdmin> {
        Arc::new(self.loader.clone())
    }
}
