//! Transform pipeline orchestrating cache, resolver, hooks and router
//!
//! Elements are processed strictly one at a time, in arrival order:
//!
//! 1. the element is snapshotted into the reference cache as received
//! 2. ways and relations have their references resolved
//! 3. the hook for the element type (or the pass-through default) runs
//! 4. every emitted record is cached again and routed
//!
//! The next element is only pulled once the previous one is fully routed, so
//! a way always sees every point that came before it, as rewritten by hooks.

use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use log::{debug, info, trace, warn};
use tokio_util::sync::CancellationToken;

use crate::core::cache::{CacheStore, ReferenceCache};
use crate::core::element::{Element, ElementType, Record};
use crate::core::error::{Error, Result};
use crate::core::hooks::HookTable;
use crate::core::options::{Events, ExportEvent};
use crate::core::resolver::{resolve_relation, resolve_way, Related};
use crate::core::router::{normalize_collection, CollectionRouter, RouterSummary};

/// Result of a completed export
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSummary {
    pub points: u64,
    pub ways: u64,
    pub relations: u64,
    /// Records emitted per collection, whether or not it had its own sink
    pub records: BTreeMap<String, u64>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Stopped early by the cancellation token
    pub cancelled: bool,
    pub sinks: RouterSummary,
}

impl ExportSummary {
    pub fn elements(&self, kind: ElementType) -> u64 {
        match kind {
            ElementType::Point => self.points,
            ElementType::Way => self.ways,
            ElementType::Relation => self.relations,
        }
    }

    /// Records routed in total, i.e. records in the merged output
    pub fn total_records(&self) -> u64 {
        self.records.values().sum()
    }

    fn count(&mut self, kind: ElementType) {
        match kind {
            ElementType::Point => self.points += 1,
            ElementType::Way => self.ways += 1,
            ElementType::Relation => self.relations += 1,
        }
    }
}

/// Single-pass exporter over one element stream
pub struct ExportPipeline<S> {
    cache: ReferenceCache<S>,
    hooks: HookTable,
    router: CollectionRouter,
    events: Events,
    retain_cache: bool,
    total_bytes: Option<u64>,
    bytes_read: Arc<AtomicU64>,
    summary: ExportSummary,
}

impl<S: CacheStore> ExportPipeline<S> {
    pub fn new(cache: ReferenceCache<S>, hooks: HookTable, router: CollectionRouter, events: Events) -> Self {
        Self {
            cache,
            hooks,
            router,
            events,
            retain_cache: false,
            total_bytes: None,
            bytes_read: Arc::new(AtomicU64::new(0)),
            summary: ExportSummary::default(),
        }
    }

    /// Keep the cache store instead of destroying it at the end
    pub fn retain_cache(mut self, retain: bool) -> Self {
        self.retain_cache = retain;
        self
    }

    /// Report input size and progress from a reader counting the bytes it consumed
    pub fn with_input(mut self, total_bytes: Option<u64>, bytes_read: Arc<AtomicU64>) -> Self {
        self.total_bytes = total_bytes;
        self.bytes_read = bytes_read;
        self
    }

    /// Drain `elements`, then close every sink and tear the cache down
    ///
    /// Cancelling `cancel` stops the export between elements; whatever was
    /// routed so far is closed off properly and the summary is marked as
    /// cancelled.
    pub async fn run<St>(mut self, elements: St, cancel: CancellationToken) -> Result<ExportSummary>
    where
        St: Stream<Item = Result<Element>>,
    {
        self.events.emit(ExportEvent::Start {
            total_bytes: self.total_bytes,
        });

        match self.drive(elements, &cancel).await {
            Ok(cancelled) => {
                self.summary.cancelled = cancelled;
                self.finish().await
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Returns whether the run was cancelled
    async fn drive<St>(&mut self, elements: St, cancel: &CancellationToken) -> Result<bool>
    where
        St: Stream<Item = Result<Element>>,
    {
        let mut elements = pin!(elements);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Export cancelled while waiting for input");
                    return Ok(true);
                }
                next = elements.next() => next,
            };
            let Some(element) = next else {
                return Ok(false);
            };
            let element = element?;
            let (kind, id) = (element.kind(), element.id());

            let routes = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Export cancelled, abandoning {kind} {id}");
                    return Ok(true);
                }
                routes = self.prepare(element) => routes?,
            };

            for (collection, record) in routes {
                self.emit(&collection, &record).await?;
            }
        }
    }

    /// Cache, resolve and hook one element, yielding what it should emit
    async fn prepare(&mut self, element: Element) -> Result<Vec<(String, Record)>> {
        let kind = element.kind();
        let id = element.id();
        trace!("{kind} {id} received");
        self.summary.count(kind);

        self.cache.write_received(&element).await?;

        let related = match &element {
            Element::Point(_) => Related::None,
            Element::Way(way) => Related::Way(resolve_way(&self.cache, way).await?),
            Element::Relation(relation) => Related::Relation(resolve_relation(&self.cache, relation).await?),
        };
        trace!("{kind} {id} resolved");

        if self.hooks.contains(kind) {
            self.events.emit(ExportEvent::HookInvoked { kind, id });
        }
        let outcome = self.hooks.dispatch(element, related).await?;

        let routes = outcome.into_routes(kind);
        if routes.is_empty() {
            debug!("{kind} {id} dropped by hook");
        }
        Ok(routes)
    }

    async fn emit(&mut self, collection: &str, record: &Record) -> Result<()> {
        self.cache.write_routed(record).await?;
        self.router.route(collection, record).await?;
        *self
            .summary
            .records
            .entry(normalize_collection(collection))
            .or_default() += 1;
        Ok(())
    }

    async fn finish(self) -> Result<ExportSummary> {
        let Self {
            cache,
            router,
            events,
            retain_cache,
            bytes_read,
            mut summary,
            ..
        } = self;

        let sinks = match router.finish().await {
            Ok(sinks) => sinks,
            Err(e) => {
                teardown(cache, retain_cache).await.unwrap_or_else(log_teardown_failure);
                return Err(report(&events, e));
            }
        };
        if let Err(e) = teardown(cache, retain_cache).await {
            return Err(report(&events, e));
        }

        summary.bytes_read = bytes_read.load(Ordering::Relaxed);
        summary.bytes_written = sinks.bytes_written();
        summary.sinks = sinks;

        info!(
            "Exported {} points, {} ways, {} relations as {} records ({} bytes written)",
            summary.points,
            summary.ways,
            summary.relations,
            summary.total_records(),
            summary.bytes_written
        );
        events.emit(ExportEvent::End {
            bytes_read: summary.bytes_read,
            bytes_written: summary.bytes_written,
        });
        Ok(summary)
    }

    /// Fatal path: sinks are flushed but never closed, the cache is still torn down
    async fn abort(self, error: Error) -> Error {
        let Self {
            cache,
            mut router,
            events,
            retain_cache,
            ..
        } = self;
        if let Err(e) = router.flush().await {
            warn!("Failed to flush outputs after error: {e}");
        }
        drop(router);

        teardown(cache, retain_cache).await.unwrap_or_else(log_teardown_failure);
        report(&events, error)
    }
}

/// Emit `error` as an [`ExportEvent::Error`] and hand it back
pub(crate) fn report(events: &Events, error: Error) -> Error {
    events.emit(ExportEvent::Error {
        message: error.to_string(),
    });
    error
}

pub(crate) fn log_teardown_failure(error: Error) {
    warn!("Failed to tear down reference cache: {error}");
}

pub(crate) async fn teardown<S: CacheStore>(cache: ReferenceCache<S>, retain: bool) -> Result<()> {
    if retain {
        debug!("Keeping reference cache");
        drop(cache.into_store());
        Ok(())
    } else {
        cache.destroy().await
    }
}
