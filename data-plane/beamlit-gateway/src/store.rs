//! In-memory route store with host lookup indexes.

use beamlit_routes::Route;
use dashmap::DashMap;

use crate::error::GatewayError;

/// Routes by name, plus two secondary indexes: matched hostname → route and
/// backend host (port stripped) → route. The backend index serves the retry
/// path, which needs to find the route a failed upstream belongs to.
#[derive(Default)]
pub struct RouteStore {
    routes: DashMap<String, Route>,
    by_hostname: DashMap<String, String>,
    by_backend_host: DashMap<String, String>,
}

impl RouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, route: Route) -> Result<Route, GatewayError> {
        route.validate()?;
        self.unindex(&route.name);
        for hostname in &route.hostnames {
            self.by_hostname
                .insert(hostname.clone(), route.name.clone());
        }
        for backend in &route.backends {
            self.by_backend_host.insert(
                backend.host_without_port().to_string(),
                route.name.clone(),
            );
        }
        self.routes.insert(route.name.clone(), route.clone());
        Ok(route)
    }

    pub fn get(&self, name: &str) -> Result<Route, GatewayError> {
        self.routes
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::RouteNotFound(name.to_string()))
    }

    pub fn delete(&self, name: &str) -> Result<Route, GatewayError> {
        let (_, route) = self
            .routes
            .remove(name)
            .ok_or_else(|| GatewayError::RouteNotFound(name.to_string()))?;
        self.unindex_route(&route);
        Ok(route)
    }

    /// Route matched by a request's Host header (port stripped).
    pub fn by_host(&self, host: &str) -> Result<Route, GatewayError> {
        let bare = host.split(':').next().unwrap_or(host);
        let name = self
            .by_hostname
            .get(bare)
            .map(|n| n.clone())
            .ok_or_else(|| GatewayError::NoRoute(host.to_string()))?;
        self.get(&name)
    }

    /// Route owning a backend host; used when an upstream fails and the
    /// proxy needs to re-draw among the remaining backends.
    pub fn by_backend_host(&self, host: &str) -> Result<Route, GatewayError> {
        let bare = host.split(':').next().unwrap_or(host);
        let name = self
            .by_backend_host
            .get(bare)
            .map(|n| n.clone())
            .ok_or_else(|| GatewayError::NoRoute(host.to_string()))?;
        self.get(&name)
    }

    fn unindex(&self, name: &str) {
        if let Some(route) = self.routes.get(name).map(|r| r.clone()) {
            self.unindex_route(&route);
        }
    }

    fn unindex_route(&self, route: &Route) {
        for hostname in &route.hostnames {
            self.by_hostname
                .remove_if(hostname, |_, owner| owner == &route.name);
        }
        for backend in &route.backends {
            self.by_backend_host
                .remove_if(backend.host_without_port(), |_, owner| {
                    owner == &route.name
                });
        }
    }
}
