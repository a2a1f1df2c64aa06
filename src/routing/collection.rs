//! # Route Collection
//!
//! The ordered route set the dispatcher matches against, assembled from route loaders.
//!
//! Loaders that report a fingerprint have their descriptor list cached in the shared
//! store under `route_loader_<identifier>`; as long as the fingerprint is unchanged the
//! loader itself is never invoked again. Every `load()` fully replaces the route list.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::caching::{KvStore, SharedStore, StoreExt};
use crate::core::error::GatewayResult;
use crate::middleware::factory::MiddlewareFactory;
use crate::routing::loaders::RouteLoader;
use crate::routing::pattern::RoutePattern;
use crate::routing::route::{Route, RouteDescriptor, RouteMatch};

const LOADER_KEY_PREFIX: &str = "route_loader_";

/// Cached output of one loader
#[derive(Debug, Serialize, Deserialize)]
struct LoaderCacheEntry {
    fingerprint: String,
    data: Vec<Value>,
}

/// Ordered routes plus the loaders they come from
#[derive(Debug)]
pub struct RouteCollection {
    routes: Vec<Arc<Route>>,
    loaders: Vec<Arc<dyn RouteLoader>>,
    factory: MiddlewareFactory,
    store: Option<SharedStore>,
}

impl RouteCollection {
    /// Empty collection; the store defaults to the factory's shared store
    pub fn new(factory: MiddlewareFactory) -> Self {
        let store = factory.shared().map(|shared| shared.store.clone());
        Self {
            routes: Vec::new(),
            loaders: Vec::new(),
            factory,
            store,
        }
    }

    pub fn with_loader(mut self, loader: impl RouteLoader + 'static) -> Self {
        self.loaders.push(Arc::new(loader));
        self
    }

    pub fn add_loader(&mut self, loader: Arc<dyn RouteLoader>) {
        self.loaders.push(loader);
    }

    /// Use a specific store for loader caching, or none at all
    pub fn with_store(mut self, store: Option<SharedStore>) -> Self {
        self.store = store;
        self
    }

    /// Routes in match order
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Rebuild the route list from every loader.
    ///
    /// Malformed descriptors are skipped with a warning; an unknown middleware or a
    /// failing loader aborts the load and leaves the previous routes in place.
    pub async fn load(&mut self) -> GatewayResult<usize> {
        let mut routes = Vec::new();

        for loader in &self.loaders {
            let descriptors = self.descriptors_for(loader.as_ref()).await?;
            for raw in descriptors {
                if let Some(route) = self.build_route(&raw)? {
                    routes.push(Arc::new(route));
                }
            }
        }

        info!("Loaded {} routes from {} loaders", routes.len(), self.loaders.len());
        self.routes = routes;
        Ok(self.routes.len())
    }

    async fn descriptors_for(&self, loader: &dyn RouteLoader) -> GatewayResult<Vec<Value>> {
        let fingerprint = loader.fingerprint().await?;
        let (fingerprint, store) = match (fingerprint, &self.store) {
            (Some(fingerprint), Some(store)) => (fingerprint, store),
            _ => return loader.load().await,
        };

        let key = cache_key(loader);
        if let Some(entry) = store.get_json::<LoaderCacheEntry>(&key).await? {
            if entry.fingerprint == fingerprint {
                debug!("Reusing cached routes for loader {}", loader.identifier());
                return Ok(entry.data);
            }
        }

        let data = loader.load().await?;
        let entry = LoaderCacheEntry { fingerprint, data };
        store.set_json(&key, &entry, Duration::ZERO).await?;
        Ok(entry.data)
    }

    fn build_route(&self, raw: &Value) -> GatewayResult<Option<Route>> {
        let descriptor: RouteDescriptor = match serde_json::from_value(raw.clone()) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Skipping malformed route descriptor: {}", e);
                return Ok(None);
            }
        };

        if !descriptor.enabled {
            debug!("Skipping disabled route {}", descriptor.path);
            return Ok(None);
        }

        let pattern = match RoutePattern::parse_with_methods(&descriptor.path, &descriptor.methods) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!("Skipping route {}: {}", descriptor.path, e);
                return Ok(None);
            }
        };

        let middlewares = self.factory.create_many(&descriptor.middlewares)?;

        match Route::new(pattern, descriptor.target, middlewares) {
            Ok(route) => Ok(Some(route)),
            Err(e) => {
                warn!("Skipping route {}: {}", descriptor.path, e);
                Ok(None)
            }
        }
    }

    /// First route accepting the request
    pub fn find(&self, method: &Method, path: &str, query: Option<&str>) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            route.matches(method, path).map(|captures| RouteMatch {
                route: route.clone(),
                captures,
                target_url: route.target_url(path, query),
            })
        })
    }

    /// Drop every loader cache entry and the loaded routes
    pub async fn clear_cache(&mut self) -> GatewayResult<()> {
        if let Some(store) = &self.store {
            for loader in &self.loaders {
                store.delete(&cache_key(loader.as_ref())).await?;
            }
        }
        self.routes.clear();
        Ok(())
    }
}

fn cache_key(loader: &dyn RouteLoader) -> String {
    format!("{}{}", LOADER_KEY_PREFIX, loader.identifier())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::InMemoryStore;
    use crate::core::error::GatewayError;
    use crate::middleware::factory::SharedState;
    use crate::routing::loaders::StaticLoader;
    use serde_json::json;

    fn factory(store: SharedStore) -> MiddlewareFactory {
        MiddlewareFactory::default().with_shared(SharedState::new(store))
    }

    #[tokio::test]
    async fn test_skips_malformed_and_disabled_descriptors() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let mut collection = RouteCollection::new(factory(store)).with_loader(StaticLoader::new(
            "inline",
            vec![
                json!({"path": "/ok", "target": "http://ok/"}),
                json!({"path": "/no-target"}),
                json!({"target": "http://no-path/"}),
                json!({"path": "/off", "target": "http://off/", "enabled": false}),
                json!({"path": "/bad", "target": "not a url"}),
                json!({"path": "/second", "target": "http://second/", "methods": ["POST"]}),
            ],
        ));

        assert_eq!(collection.load().await.unwrap(), 2);
        let patterns: Vec<_> = collection.routes().iter().map(|r| r.pattern().as_str().to_string()).collect();
        assert_eq!(patterns, vec!["/ok", "/second"]);
        assert_eq!(collection.routes()[1].pattern().methods(), &[Method::POST]);
    }

    #[tokio::test]
    async fn test_unknown_middleware_fails_load() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let mut collection = RouteCollection::new(factory(store)).with_loader(StaticLoader::new(
            "inline",
            vec![json!({"path": "/x", "target": "http://x/", "middlewares": "nope"})],
        ));

        match collection.load().await {
            Err(GatewayError::Configuration { message }) => assert!(message.contains("nope")),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_find_first_match() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let mut collection = RouteCollection::new(factory(store)).with_loader(StaticLoader::new(
            "inline",
            vec![
                json!({"path": "GET /api/special", "target": "http://special"}),
                json!({"path": "/api/*", "target": "http://general/"}),
            ],
        ));
        collection.load().await.unwrap();

        let special = collection.find(&Method::GET, "/api/special", None).unwrap();
        assert_eq!(special.target_url, "http://special/api/special");

        let general = collection.find(&Method::POST, "/api/special", Some("a=1")).unwrap();
        assert_eq!(general.captures, vec!["special".to_string()]);
        assert_eq!(general.target_url, "http://general/special?a=1");

        assert!(collection.find(&Method::GET, "/other", None).is_none());
    }

    #[tokio::test]
    async fn test_clear_cache_removes_loader_entries() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let mut collection = RouteCollection::new(factory(store.clone())).with_loader(
            StaticLoader::new("pinned", vec![json!({"path": "/x", "target": "http://x"})]).with_fingerprint("v1"),
        );

        collection.load().await.unwrap();
        assert!(store.has("route_loader_pinned").await.unwrap());

        collection.clear_cache().await.unwrap();
        assert!(!store.has("route_loader_pinned").await.unwrap());
        assert!(collection.is_empty());
    }
}
