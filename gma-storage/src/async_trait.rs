//! Async local access for use inside async runtimes.
//!
//! Both backends are synchronous. [`BlockingLocalAccess`] moves each call
//! onto tokio's blocking pool so a slow SQLite write never stalls the
//! executor thread.

use crate::LocalAccess;
use ::async_trait::async_trait;
use gma_core::{
    AspectKey, AspectRecord, AuditStamp, GmaResult, IndexFilter, IndexGroupByCriterion,
    IndexSortCriterion, ListResult, StorageError, Urn,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Async mirror of [`LocalAccess`].
#[async_trait]
pub trait AsyncLocalAccess: Send + Sync {
    // ========================================================================
    // WRITES
    // ========================================================================

    async fn add(
        &self,
        urn: &Urn,
        aspect_type: &str,
        payload: &str,
        audit: &AuditStamp,
    ) -> GmaResult<()>;

    // ========================================================================
    // READS
    // ========================================================================

    async fn batch_get_union(
        &self,
        keys: &[AspectKey],
        limit: i32,
        offset: i32,
    ) -> GmaResult<Vec<AspectRecord>>;

    async fn exists(&self, urn: &Urn) -> GmaResult<bool>;

    async fn list_urns(
        &self,
        filter: &IndexFilter,
        sort: Option<&IndexSortCriterion>,
        start: i32,
        page_size: i32,
    ) -> GmaResult<ListResult<Urn>>;

    async fn list_urns_after(
        &self,
        filter: &IndexFilter,
        sort: Option<&IndexSortCriterion>,
        last_urn: Option<&Urn>,
        page_size: i32,
    ) -> GmaResult<Vec<Urn>>;

    async fn count_aggregate(
        &self,
        filter: &IndexFilter,
        group_by: &IndexGroupByCriterion,
    ) -> GmaResult<BTreeMap<String, i64>>;

    async fn list_aspect_urns(
        &self,
        aspect_type: &str,
        start: i32,
        page_size: i32,
    ) -> GmaResult<ListResult<Urn>>;
}

/// Runs a synchronous [`LocalAccess`] on the blocking pool.
#[derive(Debug)]
pub struct BlockingLocalAccess<S> {
    inner: Arc<S>,
}

impl<S> Clone for BlockingLocalAccess<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: LocalAccess + 'static> BlockingLocalAccess<S> {
    pub fn new(inner: S) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<S>) -> Self {
        Self { inner }
    }

    /// The wrapped synchronous backend.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn run<T, F>(&self, f: F) -> GmaResult<T>
    where
        F: FnOnce(&S) -> GmaResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StorageError::Io {
                reason: format!("blocking task failed: {}", e),
            })?
    }
}

#[async_trait]
impl<S: LocalAccess + 'static> AsyncLocalAccess for BlockingLocalAccess<S> {
    async fn add(
        &self,
        urn: &Urn,
        aspect_type: &str,
        payload: &str,
        audit: &AuditStamp,
    ) -> GmaResult<()> {
        let (urn, aspect_type, payload, audit) = (
            urn.clone(),
            aspect_type.to_string(),
            payload.to_string(),
            audit.clone(),
        );
        self.run(move |s| s.add(&urn, &aspect_type, &payload, &audit))
            .await
    }

    async fn batch_get_union(
        &self,
        keys: &[AspectKey],
        limit: i32,
        offset: i32,
    ) -> GmaResult<Vec<AspectRecord>> {
        let keys = keys.to_vec();
        self.run(move |s| s.batch_get_union(&keys, limit, offset))
            .await
    }

    async fn exists(&self, urn: &Urn) -> GmaResult<bool> {
        let urn = urn.clone();
        self.run(move |s| s.exists(&urn)).await
    }

    async fn list_urns(
        &self,
        filter: &IndexFilter,
        sort: Option<&IndexSortCriterion>,
        start: i32,
        page_size: i32,
    ) -> GmaResult<ListResult<Urn>> {
        let (filter, sort) = (filter.clone(), sort.cloned());
        self.run(move |s| s.list_urns(&filter, sort.as_ref(), start, page_size))
            .await
    }

    async fn list_urns_after(
        &self,
        filter: &IndexFilter,
        sort: Option<&IndexSortCriterion>,
        last_urn: Option<&Urn>,
        page_size: i32,
    ) -> GmaResult<Vec<Urn>> {
        let (filter, sort, last_urn) = (filter.clone(), sort.cloned(), last_urn.cloned());
        self.run(move |s| s.list_urns_after(&filter, sort.as_ref(), last_urn.as_ref(), page_size))
            .await
    }

    async fn count_aggregate(
        &self,
        filter: &IndexFilter,
        group_by: &IndexGroupByCriterion,
    ) -> GmaResult<BTreeMap<String, i64>> {
        let (filter, group_by) = (filter.clone(), group_by.clone());
        self.run(move |s| s.count_aggregate(&filter, &group_by))
            .await
    }

    async fn list_aspect_urns(
        &self,
        aspect_type: &str,
        start: i32,
        page_size: i32,
    ) -> GmaResult<ListResult<Urn>> {
        let aspect_type = aspect_type.to_string();
        self.run(move |s| s.list_aspect_urns(&aspect_type, start, page_size))
            .await
    }
}
