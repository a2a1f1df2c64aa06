//! # Route Loaders
//!
//! A loader produces raw route descriptors. Its fingerprint tells the route collection
//! whether the previous output can be reused; `None` means "always load".

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

use crate::core::config::is_json_path;
use crate::core::error::{GatewayError, GatewayResult};

/// Source of raw route descriptors
#[async_trait]
pub trait RouteLoader: Send + Sync + std::fmt::Debug {
    /// Stable name used to key this loader's cache entry
    fn identifier(&self) -> String;

    /// Opaque change marker, or `None` to bypass caching
    async fn fingerprint(&self) -> GatewayResult<Option<String>>;

    /// Produce the descriptor list
    async fn load(&self) -> GatewayResult<Vec<Value>>;
}

/// Descriptors held in memory, e.g. inline routes from the dispatcher config
#[derive(Debug, Clone)]
pub struct StaticLoader {
    identifier: String,
    descriptors: Vec<Value>,
    fingerprint: Option<String>,
}

impl StaticLoader {
    pub fn new(identifier: impl Into<String>, descriptors: Vec<Value>) -> Self {
        Self {
            identifier: identifier.into(),
            descriptors,
            fingerprint: None,
        }
    }

    /// Opt into fingerprint caching
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

#[async_trait]
impl RouteLoader for StaticLoader {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    async fn fingerprint(&self) -> GatewayResult<Option<String>> {
        Ok(self.fingerprint.clone())
    }

    async fn load(&self) -> GatewayResult<Vec<Value>> {
        Ok(self.descriptors.clone())
    }
}

/// Route file in JSON or YAML, chosen by extension.
///
/// The document is either a list of descriptors or a map with a `routes` list.
#[derive(Debug, Clone)]
pub struct FileLoader {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RouteDocument {
    List(Vec<Value>),
    Wrapped {
        #[serde(default)]
        routes: Vec<Value>,
    },
}

impl FileLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, content: &str) -> GatewayResult<Vec<Value>> {
        let document: RouteDocument = if is_json_path(&self.path) {
            serde_json::from_str(content)?
        } else {
            serde_yaml::from_str(content)?
        };

        Ok(match document {
            RouteDocument::List(routes) | RouteDocument::Wrapped { routes } => routes,
        })
    }
}

#[async_trait]
impl RouteLoader for FileLoader {
    fn identifier(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn fingerprint(&self) -> GatewayResult<Option<String>> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| {
            GatewayError::config(format!("Route file {} is not readable: {}", self.path.display(), e))
        })?;

        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();

        Ok(Some(format!("{}-{}", modified, metadata.len())))
    }

    async fn load(&self) -> GatewayResult<Vec<Value>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GatewayError::config(format!("Failed to read route file {}: {}", self.path.display(), e))
        })?;

        let routes = self.parse(&content)?;
        debug!("Read {} route descriptors from {}", routes.len(), self.path.display());
        Ok(routes)
    }
}
