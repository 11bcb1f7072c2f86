//! # Config Manager
//!
//! Owns the authoritative route list. Routes are persisted to
//! `{config_dir}/routes.json` (pretty-printed, written atomically via a
//! temp file + rename) and mirrored to the shared store under
//! `config:routes`.
//!
//! Load order on initialize: shared store first, then the on-disk file
//! (mirrored back to the store), then a seeded default route persisted to
//! both. Mutations commit last: the in-memory list only changes once both
//! writes succeed, and a store failure after the file write restores the
//! previous file so disk and store stay in agreement.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::Method;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::WarnThrottle;
use crate::routing::{Route, RouteMatch, RouteTable};
use crate::store::SharedStore;

/// Shared-store key holding the JSON-serialized route list
pub const ROUTES_STORE_KEY: &str = "config:routes";

/// On-disk file name inside the config directory
pub const ROUTES_FILE: &str = "routes.json";

#[derive(Debug, Default)]
struct ConfigState {
    routes: Vec<Route>,
    table: RouteTable,
}

/// Route configuration store
pub struct ConfigManager {
    store: Arc<dyn SharedStore>,
    config_dir: PathBuf,
    inner: RwLock<ConfigState>,
    initialized: AtomicBool,
    store_warn: WarnThrottle,
}

impl ConfigManager {
    pub fn new(store: Arc<dyn SharedStore>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            config_dir: config_dir.into(),
            inner: RwLock::new(ConfigState::default()),
            initialized: AtomicBool::new(false),
            store_warn: WarnThrottle::per_minute(),
        }
    }

    fn routes_path(&self) -> PathBuf {
        self.config_dir.join(ROUTES_FILE)
    }

    /// Load routes following the store -> file -> seed order.
    ///
    /// Malformed route JSON from either source is fatal; an unreachable
    /// store merely falls through to the file.
    pub async fn initialize(&self) -> GatewayResult<()> {
        if let Some(routes) = self.load_from_store().await? {
            let table = RouteTable::build(&routes)?;
            *self.inner.write().await = ConfigState { routes, table };
            self.initialized.store(true, Ordering::Release);
            info!(source = "store", "route configuration loaded");
            return Ok(());
        }

        if let Some(routes) = self.load_from_file().await? {
            let table = RouteTable::build(&routes)?;
            self.mirror_to_store(&routes).await;
            *self.inner.write().await = ConfigState { routes, table };
            self.initialized.store(true, Ordering::Release);
            info!(source = "file", "route configuration loaded");
            return Ok(());
        }

        let routes = vec![default_route()];
        let table = RouteTable::build(&routes)?;
        self.write_file(&routes).await?;
        self.mirror_to_store(&routes).await;
        *self.inner.write().await = ConfigState { routes, table };
        self.initialized.store(true, Ordering::Release);
        info!(source = "seed", "route configuration seeded with default route");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Snapshot of the active route list.
    pub async fn get_routes(&self) -> Vec<Route> {
        self.inner.read().await.routes.clone()
    }

    /// Match a request against the active route table.
    pub async fn match_route(&self, path: &str, method: &Method) -> Option<RouteMatch> {
        self.inner.read().await.table.find(path, method)
    }

    /// Append a route. The name must be unique across the active set.
    pub async fn add_route(&self, route: Route) -> GatewayResult<()> {
        route.validate()?;
        let mut state = self.inner.write().await;
        if state.routes.iter().any(|r| r.name == route.name) {
            return Err(GatewayError::RouteConflict { name: route.name });
        }
        let mut candidate = state.routes.clone();
        candidate.push(route);
        self.commit(&mut state, candidate).await
    }

    /// Replace the route with the given name. Returns whether it existed.
    pub async fn update_route(&self, name: &str, route: Route) -> GatewayResult<bool> {
        route.validate()?;
        let mut state = self.inner.write().await;
        let Some(index) = state.routes.iter().position(|r| r.name == name) else {
            return Ok(false);
        };
        if route.name != name && state.routes.iter().any(|r| r.name == route.name) {
            return Err(GatewayError::RouteConflict { name: route.name });
        }
        let mut candidate = state.routes.clone();
        candidate[index] = route;
        self.commit(&mut state, candidate).await?;
        Ok(true)
    }

    /// Delete the route with the given name. Returns whether it existed.
    pub async fn delete_route(&self, name: &str) -> GatewayResult<bool> {
        let mut state = self.inner.write().await;
        let before = state.routes.len();
        let candidate: Vec<Route> = state
            .routes
            .iter()
            .filter(|r| r.name != name)
            .cloned()
            .collect();
        if candidate.len() == before {
            return Ok(false);
        }
        self.commit(&mut state, candidate).await?;
        Ok(true)
    }

    /// Persist a candidate list, then swap it in.
    ///
    /// The in-memory state is only touched after both writes succeed; a
    /// store failure after the file write restores the previous file.
    async fn commit(
        &self,
        state: &mut ConfigState,
        candidate: Vec<Route>,
    ) -> GatewayResult<()> {
        let table = RouteTable::build(&candidate)?;
        let previous = serde_json::to_string_pretty(&state.routes)?;

        self.write_file(&candidate).await?;

        let serialized = serde_json::to_string_pretty(&candidate)?;
        if let Err(e) = self.store.set(ROUTES_STORE_KEY, &serialized).await {
            // Put the old file back so disk and store stay in agreement.
            if let Err(restore) = atomic_write(&self.routes_path(), &previous).await {
                warn!(error = %restore, "failed to restore routes.json after store failure");
            }
            return Err(e.into());
        }

        state.routes = candidate;
        state.table = table;
        Ok(())
    }

    async fn load_from_store(&self) -> GatewayResult<Option<Vec<Route>>> {
        match self.store.get(ROUTES_STORE_KEY).await {
            Ok(Some(raw)) => {
                let routes: Vec<Route> = serde_json::from_str(&raw).map_err(|e| {
                    GatewayError::config(format!("invalid route JSON in shared store: {e}"))
                })?;
                if routes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(routes))
                }
            }
            Ok(None) => Ok(None),
            Err(e) => {
                if self.store_warn.should_log() {
                    warn!(error = %e, "shared store unreachable during config load");
                }
                Ok(None)
            }
        }
    }

    async fn load_from_file(&self) -> GatewayResult<Option<Vec<Route>>> {
        let path = self.routes_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let routes: Vec<Route> = serde_json::from_str(&raw).map_err(|e| {
                    GatewayError::config(format!(
                        "invalid route JSON in {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Some(routes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, routes: &[Route]) -> GatewayResult<()> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let serialized = serde_json::to_string_pretty(routes)?;
        atomic_write(&self.routes_path(), &serialized).await?;
        Ok(())
    }

    async fn mirror_to_store(&self, routes: &[Route]) {
        let serialized = match serde_json::to_string_pretty(routes) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(error = %e, "failed to serialize routes for store mirror");
                return;
            }
        };
        if let Err(e) = self.store.set(ROUTES_STORE_KEY, &serialized).await {
            if self.store_warn.should_log() {
                warn!(error = %e, "failed to mirror routes to shared store");
            }
        }
    }
}

/// Write-temp-then-rename so readers never observe a partial file.
async fn atomic_write(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Seed route used when neither the store nor the file has configuration.
fn default_route() -> Route {
    Route {
        name: "default".to_string(),
        pattern: "/api/example/:id".to_string(),
        target: "http://localhost:3001".to_string(),
        methods: Vec::new(),
        policies: Vec::new(),
        circuit_breaker: None,
        timeout_ms: None,
        retries: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::tempdir;

    fn route(name: &str, pattern: &str) -> Route {
        Route {
            name: name.to_string(),
            pattern: pattern.to_string(),
            target: "http://upstream:3000".to_string(),
            methods: Vec::new(),
            policies: Vec::new(),
            circuit_breaker: None,
            timeout_ms: None,
            retries: None,
        }
    }

    #[tokio::test]
    async fn seeds_default_route_when_nothing_exists() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let manager = ConfigManager::new(store.clone(), dir.path());
        manager.initialize().await.unwrap();

        let routes = manager.get_routes().await;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].name, "default");

        // Both persistence targets were written.
        assert!(dir.path().join(ROUTES_FILE).exists());
        assert!(store.get(ROUTES_STORE_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn store_takes_precedence_over_file() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let from_store = vec![route("from-store", "/s")];
        store
            .set(
                ROUTES_STORE_KEY,
                &serde_json::to_string(&from_store).unwrap(),
            )
            .await
            .unwrap();
        std::fs::write(
            dir.path().join(ROUTES_FILE),
            serde_json::to_string(&vec![route("from-file", "/f")]).unwrap(),
        )
        .unwrap();

        let manager = ConfigManager::new(store, dir.path());
        manager.initialize().await.unwrap();
        assert_eq!(manager.get_routes().await[0].name, "from-store");
    }

    #[tokio::test]
    async fn file_is_adopted_and_mirrored_when_store_is_empty() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        std::fs::write(
            dir.path().join(ROUTES_FILE),
            serde_json::to_string(&vec![route("from-file", "/f")]).unwrap(),
        )
        .unwrap();

        let manager = ConfigManager::new(store.clone(), dir.path());
        manager.initialize().await.unwrap();
        assert_eq!(manager.get_routes().await[0].name, "from-file");

        let mirrored = store.get(ROUTES_STORE_KEY).await.unwrap().unwrap();
        assert!(mirrored.contains("from-file"));
    }

    #[tokio::test]
    async fn malformed_file_json_is_fatal() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(ROUTES_FILE), "{not json").unwrap();
        let manager = ConfigManager::new(Arc::new(MemoryStore::new()), dir.path());
        assert!(manager.initialize().await.is_err());
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn add_then_delete_restores_the_route_set() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(Arc::new(MemoryStore::new()), dir.path());
        manager.initialize().await.unwrap();
        let before = manager.get_routes().await;

        manager.add_route(route("x", "/x")).await.unwrap();
        assert!(manager.delete_route("x").await.unwrap());
        assert_eq!(manager.get_routes().await, before);

        // A second delete reports that nothing existed.
        assert!(!manager.delete_route("x").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_names_are_conflicts() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(Arc::new(MemoryStore::new()), dir.path());
        manager.initialize().await.unwrap();

        manager.add_route(route("x", "/x")).await.unwrap();
        let err = manager.add_route(route("x", "/y")).await.unwrap_err();
        assert!(matches!(err, GatewayError::RouteConflict { .. }));
    }

    #[tokio::test]
    async fn update_reports_whether_the_target_existed() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(Arc::new(MemoryStore::new()), dir.path());
        manager.initialize().await.unwrap();
        manager.add_route(route("x", "/x")).await.unwrap();

        assert!(manager
            .update_route("x", route("x", "/x2"))
            .await
            .unwrap());
        assert!(!manager
            .update_route("ghost", route("ghost", "/g"))
            .await
            .unwrap());
        let routes = manager.get_routes().await;
        let updated = routes.iter().find(|r| r.name == "x").unwrap();
        assert_eq!(updated.pattern, "/x2");
    }

    #[tokio::test]
    async fn reload_after_restart_yields_the_same_routes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        {
            let manager = ConfigManager::new(store.clone(), dir.path());
            manager.initialize().await.unwrap();
            manager.add_route(route("x", "/x")).await.unwrap();
        }

        let reloaded = ConfigManager::new(store, dir.path());
        reloaded.initialize().await.unwrap();
        assert!(reloaded
            .get_routes()
            .await
            .iter()
            .any(|r| r.name == "x"));
    }

    #[tokio::test]
    async fn store_and_file_agree_after_every_mutation() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let manager = ConfigManager::new(store.clone(), dir.path());
        manager.initialize().await.unwrap();
        manager.add_route(route("x", "/x")).await.unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join(ROUTES_FILE)).unwrap();
        let in_store = store.get(ROUTES_STORE_KEY).await.unwrap().unwrap();
        assert_eq!(on_disk, in_store);
    }

    #[tokio::test]
    async fn store_failure_rolls_back_the_mutation() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let manager = ConfigManager::new(store.clone(), dir.path());
        manager.initialize().await.unwrap();
        let before_routes = manager.get_routes().await;
        let before_file = std::fs::read_to_string(dir.path().join(ROUTES_FILE)).unwrap();

        store.set_failing(true);
        assert!(manager.add_route(route("x", "/x")).await.is_err());
        store.set_failing(false);

        assert_eq!(manager.get_routes().await, before_routes);
        let after_file = std::fs::read_to_string(dir.path().join(ROUTES_FILE)).unwrap();
        assert_eq!(after_file, before_file);
    }

    #[tokio::test]
    async fn match_route_uses_the_active_table() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(Arc::new(MemoryStore::new()), dir.path());
        manager.initialize().await.unwrap();
        manager.add_route(route("svc", "/a/:id")).await.unwrap();

        let matched = manager.match_route("/a/42", &Method::GET).await.unwrap();
        assert_eq!(matched.route.name, "svc");
        assert_eq!(matched.params.get("id"), Some(&"42".to_string()));
    }
}
