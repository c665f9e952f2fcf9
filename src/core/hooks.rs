//! Per-element-type transform hooks
//!
//! A hook receives an element plus its related objects and decides what gets
//! emitted. Element types without a hook pass through unchanged to their
//! default collection.

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::core::element::{Element, ElementType, Record};
use crate::core::error::Result;
use crate::core::resolver::Related;

/// Records destined for one collection
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub collection: String,
    pub records: Vec<Record>,
}

/// What a hook decided to do with its element
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Emit nothing for this element
    Drop,
    /// Emit one record to the element type's default collection
    Replace(Record),
    /// Emit any number of records to any number of collections
    RouteMany(Vec<Route>),
}

impl HookOutcome {
    /// Pass the element through unchanged
    pub fn keep(element: &Element) -> Result<Self> {
        Ok(HookOutcome::Replace(element.to_record()?))
    }

    /// Flatten into `(collection, record)` pairs in emission order
    pub fn into_routes(self, kind: ElementType) -> Vec<(String, Record)> {
        match self {
            HookOutcome::Drop => Vec::new(),
            HookOutcome::Replace(record) => vec![(kind.default_collection().to_string(), record)],
            HookOutcome::RouteMany(routes) => routes
                .into_iter()
                .flat_map(|route| {
                    let collection = route.collection;
                    route
                        .records
                        .into_iter()
                        .map(move |record| (collection.clone(), record))
                })
                .collect(),
        }
    }
}

/// Builder for [`HookOutcome::RouteMany`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Routes(Vec<Route>);

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single record for `collection`
    pub fn to(self, collection: impl Into<String>, record: Record) -> Self {
        self.to_all(collection, vec![record])
    }

    /// Append several records for `collection`, each emitted on its own
    pub fn to_all(mut self, collection: impl Into<String>, records: Vec<Record>) -> Self {
        self.0.push(Route {
            collection: collection.into(),
            records,
        });
        self
    }
}

impl From<Routes> for HookOutcome {
    fn from(routes: Routes) -> Self {
        HookOutcome::RouteMany(routes.0)
    }
}

/// A transform hook for one element type
///
/// The returned future must complete exactly once; a future that never
/// resolves stalls the whole export, since elements are processed in order.
pub trait ElementHook: Send {
    fn call(&mut self, element: Element, related: Related) -> BoxFuture<'_, Result<HookOutcome>>;
}

struct SyncHook<F>(F);

impl<F> ElementHook for SyncHook<F>
where
    F: FnMut(Element, Related) -> Result<HookOutcome> + Send,
{
    fn call(&mut self, element: Element, related: Related) -> BoxFuture<'_, Result<HookOutcome>> {
        let outcome = (self.0)(element, related);
        futures::future::ready(outcome).boxed()
    }
}

struct AsyncHook<F>(F);

impl<F, Fut> ElementHook for AsyncHook<F>
where
    F: FnMut(Element, Related) -> Fut + Send,
    Fut: Future<Output = Result<HookOutcome>> + Send + 'static,
{
    fn call(&mut self, element: Element, related: Related) -> BoxFuture<'_, Result<HookOutcome>> {
        (self.0)(element, related).boxed()
    }
}

/// Handler table keyed by element type
#[derive(Default)]
pub struct HookTable {
    point: Option<Box<dyn ElementHook>>,
    way: Option<Box<dyn ElementHook>>,
    relation: Option<Box<dyn ElementHook>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous hook, replacing any previous one for `kind`
    pub fn on<F>(&mut self, kind: ElementType, hook: F) -> &mut Self
    where
        F: FnMut(Element, Related) -> Result<HookOutcome> + Send + 'static,
    {
        self.register(kind, Box::new(SyncHook(hook)))
    }

    /// Register an asynchronous hook, replacing any previous one for `kind`
    pub fn on_async<F, Fut>(&mut self, kind: ElementType, hook: F) -> &mut Self
    where
        F: FnMut(Element, Related) -> Fut + Send + 'static,
        Fut: Future<Output = Result<HookOutcome>> + Send + 'static,
    {
        self.register(kind, Box::new(AsyncHook(hook)))
    }

    pub fn register(&mut self, kind: ElementType, hook: Box<dyn ElementHook>) -> &mut Self {
        *self.slot(kind) = Some(hook);
        self
    }

    pub fn contains(&self, kind: ElementType) -> bool {
        match kind {
            ElementType::Point => self.point.is_some(),
            ElementType::Way => self.way.is_some(),
            ElementType::Relation => self.relation.is_some(),
        }
    }

    fn slot(&mut self, kind: ElementType) -> &mut Option<Box<dyn ElementHook>> {
        match kind {
            ElementType::Point => &mut self.point,
            ElementType::Way => &mut self.way,
            ElementType::Relation => &mut self.relation,
        }
    }

    /// Run the hook for the element's type, or pass the element through
    pub async fn dispatch(&mut self, element: Element, related: Related) -> Result<HookOutcome> {
        match self.slot(element.kind()) {
            Some(hook) => hook.call(element, related).await,
            None => HookOutcome::keep(&element),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::element::{Common, Point};
    use serde_json::json;

    fn point(id: i64) -> Element {
        Element::Point(Point {
            common: Common::new(id),
            lat: 0.5,
            lon: 0.25,
        })
    }

    #[tokio::test]
    async fn test_default_handler_passes_through() {
        let mut table = HookTable::new();
        let element = point(1);

        let outcome = table.dispatch(element.clone(), Related::None).await.unwrap();
        assert_eq!(outcome, HookOutcome::Replace(element.to_record().unwrap()));
        assert_eq!(
            outcome.into_routes(ElementType::Point),
            vec![("points".to_string(), element.to_record().unwrap())]
        );
    }

    #[tokio::test]
    async fn test_sync_and_async_hooks() {
        let mut table = HookTable::new();
        table
            .on(ElementType::Point, |_, _| Ok(HookOutcome::Drop))
            .on_async(ElementType::Way, |way, _| async move {
                let outcome: HookOutcome = Routes::new().to("shapes", json!({"id": way.id()})).into();
                Ok::<_, crate::core::error::Error>(outcome)
            });

        assert!(table.contains(ElementType::Point));
        assert!(!table.contains(ElementType::Relation));

        assert_eq!(
            table.dispatch(point(1), Related::None).await.unwrap(),
            HookOutcome::Drop
        );

        let way = Element::decode(br#"{"type":"way","id":5,"nodes":[]}"#).unwrap();
        let outcome = table.dispatch(way, Related::None).await.unwrap();
        assert_eq!(
            outcome.into_routes(ElementType::Way),
            vec![("shapes".to_string(), json!({"id": 5}))]
        );
    }

    #[test]
    fn test_route_many_flattens_in_order() {
        let outcome: HookOutcome = Routes::new()
            .to("stops", json!({"n": 1}))
            .to_all("points", vec![json!({"n": 2}), json!({"n": 3})])
            .to_all("empty", vec![])
            .into();

        let routes = outcome.into_routes(ElementType::Point);
        assert_eq!(
            routes,
            vec![
                ("stops".to_string(), json!({"n": 1})),
                ("points".to_string(), json!({"n": 2})),
                ("points".to_string(), json!({"n": 3})),
            ]
        );
    }

    #[test]
    fn test_drop_emits_nothing() {
        assert!(HookOutcome::Drop.into_routes(ElementType::Relation).is_empty());
    }
}
