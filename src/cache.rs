//! TTL cache for catalog listings.
//!
//! Listings are keyed by their serialized filter. Entries expire after the
//! configured stale time; any catalog, lot or order write drops them all.

use moka::future::Cache;
use std::time::Duration;

use crate::domain::aggregates::Product;
use crate::store::{Page, ProductFilter};

#[derive(Clone)]
pub struct QueryCache {
    products: Cache<String, Page<Product>>,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        let products = Cache::builder().max_capacity(max_entries).time_to_live(ttl).build();
        Self { products }
    }

    fn key(filter: &ProductFilter) -> String {
        // ProductFilter only holds plain data, so serialization cannot fail
        serde_json::to_string(filter).unwrap_or_default()
    }

    pub async fn product_page(&self, filter: &ProductFilter) -> Option<Page<Product>> {
        let hit = self.products.get(&Self::key(filter)).await;
        if hit.is_some() {
            tracing::debug!(?filter, "product listing served from cache");
        }
        hit
    }

    pub async fn store_product_page(&self, filter: &ProductFilter, page: Page<Product>) {
        self.products.insert(Self::key(filter), page).await;
    }

    pub fn invalidate(&self) {
        self.products.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Pagination;

    fn page() -> Page<Product> { Page::new(vec![], Pagination::default(), 0) }

    #[tokio::test]
    async fn caches_by_filter() {
        let cache = QueryCache::new(Duration::from_secs(60), 10);
        let all = ProductFilter::default();
        let branded = ProductFilter { brand: Some("Bayer".into()), ..Default::default() };

        cache.store_product_page(&all, page()).await;
        assert!(cache.product_page(&all).await.is_some());
        assert!(cache.product_page(&branded).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_drops_everything() {
        let cache = QueryCache::new(Duration::from_secs(60), 10);
        let all = ProductFilter::default();
        cache.store_product_page(&all, page()).await;
        cache.invalidate();
        assert!(cache.product_page(&all).await.is_none());
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = QueryCache::new(Duration::from_millis(20), 10);
        let all = ProductFilter::default();
        cache.store_product_page(&all, page()).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.product_page(&all).await.is_none());
    }
}
