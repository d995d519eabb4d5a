//! Routes assigned to the signed-in driver.
//!
//! Joins every assignment of the driver with its `rutas/{id}` record and
//! publishes the resulting list, and builds the detail view of the route the
//! active assignment points at.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::{collection_entries, paths, RemoteStore};
use crate::{stops, ActiveAssignment, Route, SessionStateMachine, Stop, StoreError};

// ---

/// Map centre used when a route has no located stop.
pub const DEFAULT_CENTER: (f64, f64) = (40.4168, -3.7038);

/// Route name shown when the driver has no assignment.
pub const NO_ACTIVE_ROUTE: &str = "No active route";

/// Detail of the route being driven.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRouteView {
    // ---
    pub route_name: String,
    pub distance: String,
    pub duration: String,
    pub stops: Vec<Stop>,
    /// `(lat, lon)` of every located stop, in stop order.
    pub route_points: Vec<(f64, f64)>,
    pub center: (f64, f64),
}

impl ActiveRouteView {
    fn named(route_name: &str) -> Self {
        // ---
        Self {
            route_name: route_name.to_string(),
            distance: "--".to_string(),
            duration: "--".to_string(),
            stops: Vec::new(),
            route_points: Vec::new(),
            center: DEFAULT_CENTER,
        }
    }

    fn from_route(assignment: &ActiveAssignment, route: Route) -> Self {
        // ---
        let route_points = stops::route_points(&route.stops);
        let center = route_points.first().copied().unwrap_or(DEFAULT_CENTER);

        Self {
            route_name: assignment.route_name.clone(),
            distance: route.distance_label(),
            duration: route.duration_label(),
            stops: route.stops,
            route_points,
            center,
        }
    }

    /// Flip the completed mark of stop `id`. Returns false for unknown ids.
    pub fn toggle_stop(&mut self, id: &str) -> bool {
        // ---
        match self.stops.iter_mut().find(|s| s.id == id) {
            Some(stop) => {
                stop.completed = !stop.completed;
                true
            }
            None => false,
        }
    }

    pub fn completed_stops(&self) -> usize {
        self.stops.iter().filter(|s| s.completed).count()
    }

    /// Fraction of stops completed, 0.0 for a route without stops.
    pub fn progress(&self) -> f32 {
        // ---
        if self.stops.is_empty() {
            return 0.0;
        }
        self.completed_stops() as f32 / self.stops.len() as f32
    }
}

/// Observable list of the driver's routes.
pub struct RouteCatalog {
    // ---
    session: Arc<SessionStateMachine>,
    store: Arc<dyn RemoteStore>,
    routes: watch::Sender<Vec<Route>>,
}

impl RouteCatalog {
    pub fn new(session: Arc<SessionStateMachine>, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            session,
            store,
            routes: watch::Sender::new(Vec::new()),
        }
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Route>> {
        self.routes.subscribe()
    }

    /// Reload and publish every route assigned to the driver.
    ///
    /// Without a session the list is emptied. Routes that are missing or
    /// unreadable are left out; failing to read the assignments is an error.
    pub async fn load_routes(&self) -> Result<Vec<Route>, StoreError> {
        // ---
        let Some(uid) = self.session.conductor().map(|c| c.uid) else {
            debug!("No session, clearing route list");
            self.routes.send_replace(Vec::new());
            return Ok(Vec::new());
        };

        let collection = self.store.get(paths::ASSIGNMENTS).await?.unwrap_or(Value::Null);
        let mut routes = Vec::new();

        for (key, value) in collection_entries(&collection) {
            let Some(record) = value.as_object() else {
                continue;
            };
            if ActiveAssignment::driver_of(record).as_deref() != Some(uid.as_str()) {
                continue;
            }
            let assignment = ActiveAssignment::from_record(&key, record);
            if assignment.route_id.is_empty() {
                continue;
            }

            let ActiveAssignment {
                assignment_id,
                route_id,
                vehicle_plate,
                ..
            } = &assignment;
            if let Some(route) = self.fetch_route(route_id, assignment_id, vehicle_plate).await {
                routes.push(route);
            }
        }

        info!("Loaded {} routes for {}", routes.len(), uid);
        self.routes.send_replace(routes.clone());
        Ok(routes)
    }

    /// Detail view of the route referenced by the active assignment.
    pub async fn active_route(&self) -> ActiveRouteView {
        // ---
        let Some(assignment) = self.session.assignment() else {
            return ActiveRouteView::named(NO_ACTIVE_ROUTE);
        };

        match self
            .fetch_route(&assignment.route_id, &assignment.assignment_id, &assignment.vehicle_plate)
            .await
        {
            Some(route) => ActiveRouteView::from_route(&assignment, route),
            None => ActiveRouteView::named(&assignment.route_name),
        }
    }

    async fn fetch_route(&self, route_id: &str, assignment_id: &str, plate: &str) -> Option<Route> {
        // ---
        match self.store.get(&paths::route(route_id)).await {
            Ok(Some(Value::Object(record))) => {
                Some(Route::from_record(route_id, &record, assignment_id, plate))
            }
            Ok(Some(_)) => {
                warn!("Route {} is not a record, skipping", route_id);
                None
            }
            Ok(None) => {
                debug!("Route {} not found", route_id);
                None
            }
            Err(e) => {
                warn!("Failed to read route {}: {}", route_id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::memory::{MemoryIdentity, MemoryStore};
    use crate::RouteStatus;
    use serde_json::json;

    fn fleet() -> Value {
        // ---
        json!({
            "conductores": { "u1": { "nombre": "Ana" } },
            "asignaciones": {
                "a1": {
                    "id_conductor": "u1",
                    "id_ruta": "r1",
                    "nombre_ruta": "Centro",
                    "matricula_vehiculo": "1234ABC"
                },
                "a2": { "id_conductor": "u1", "id_ruta": "missing" },
                "a3": { "id_conductor": "u2", "id_ruta": "r1" },
                "a4": { "id_conductor": "u1" },
                "a5": { "id_conductor": "u1", "id_ruta": 7 }
            },
            "rutas": {
                "r1": {
                    "nombre": "Centro - Norte",
                    "hora_inicio_prevista": "08:00",
                    "hora_fin_prevista": "10:30",
                    "estado": "En curso",
                    "paradas": {
                        "1": { "direccion": "B", "orden": 2, "coords": [40.5, -3.6] },
                        "0": { "direccion": "A", "orden": 1, "coords": [40.4, -3.7] },
                        "2": { "direccion": "C", "orden": 3 }
                    }
                }
            }
        })
    }

    async fn catalog(data: Value, login: bool) -> RouteCatalog {
        // ---
        let store = Arc::new(MemoryStore::with_data(data));
        let identity = Arc::new(MemoryIdentity::new().with_account("ana@x.com", "pw", "u1"));
        let session = Arc::new(SessionStateMachine::new(identity, store.clone(), None));
        if login {
            session.login("ana@x.com", "pw").await.unwrap();
        }
        RouteCatalog::new(session, store)
    }

    #[tokio::test]
    async fn loads_only_the_drivers_readable_routes() {
        // ---
        let catalog = catalog(fleet(), true).await;
        let mut updates = catalog.subscribe();

        let routes = catalog.load_routes().await.unwrap();
        assert_eq!(routes.len(), 1);

        let route = &routes[0];
        assert_eq!(route.name, "Centro - Norte");
        assert_eq!(route.assignment_id, "a1");
        assert_eq!(route.vehicle_plate, "1234ABC");
        assert_eq!(route.status, RouteStatus::InProgress);
        assert_eq!(route.duration_label(), "2h 30min");

        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn no_session_means_no_routes() {
        // ---
        let catalog = catalog(fleet(), false).await;
        assert!(catalog.load_routes().await.unwrap().is_empty());
        assert!(catalog.routes().is_empty());
        assert_eq!(catalog.active_route().await.route_name, NO_ACTIVE_ROUTE);
    }

    #[tokio::test]
    async fn active_route_view() {
        // ---
        let catalog = catalog(fleet(), true).await;
        let mut view = catalog.active_route().await;

        assert_eq!(view.route_name, "Centro");
        assert_eq!(view.distance, "45 km");
        assert_eq!(view.duration, "2h 30min");
        let addresses: Vec<&str> = view.stops.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(addresses, ["A", "B", "C"]);
        assert_eq!(view.route_points, vec![(40.4, -3.7), (40.5, -3.6)]);
        assert_eq!(view.center, (40.4, -3.7));

        assert!(view.toggle_stop("1"));
        assert!(!view.toggle_stop("nope"));
        assert_eq!(view.completed_stops(), 1);
        assert!((view.progress() - 1.0 / 3.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn missing_route_keeps_assignment_name() {
        // ---
        let mut data = fleet();
        data["rutas"] = json!({});
        let catalog = catalog(data, true).await;

        let view = catalog.active_route().await;
        assert_eq!(view.route_name, "Centro");
        assert_eq!(view.duration, "--");
        assert!(view.stops.is_empty());
        assert_eq!(view.center, DEFAULT_CENTER);
        assert_eq!(view.progress(), 0.0);
    }
}
