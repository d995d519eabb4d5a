//! `fieldtrack`: location streaming and session synchronization for field
//! drivers.
//!
//! A driver signs in through the [`session::SessionStateMachine`], which loads
//! the driver profile and active assignment from the remote store. While a
//! route is being driven, the [`tracking::RouteTrackingOrchestrator`] turns
//! the [`location::LocationProvider`] stream into current-position writes
//! through the [`sync::SyncGateway`].
//!
//! This crate follows the Explicit Module Boundary Pattern (EMBP): shared
//! types are re-exported here and sibling modules import them from the crate
//! root rather than from each other's internals. The remote store contract
//! (`RemoteStore`, `IdentityProvider`, wire `paths`) is reached through its
//! own gateway, [`store`].

pub mod catalog;
pub mod config;
mod error;
pub mod incidents;
pub mod location;
mod models;
pub mod session;
pub mod stops;
pub mod store;
pub mod sync;
pub mod tracking;

pub use config::Config;
pub use error::{
    AuthError, IncidentError, LocationError, SessionError, StoreError, TrackingError,
};
pub use models::{
    duration_label, ActiveAssignment, ConductorSession, IncidentReport, IncidentType,
    LocationRecord, LocationSample, Route, RouteStatus, Stop, TIMESTAMP_FORMAT,
};

pub use catalog::{ActiveRouteView, RouteCatalog};
pub use incidents::IncidentReporter;
pub use location::{LocationProvider, LocationStream, ReplayLocationSource};
pub use session::{PushTokenSource, SessionPhase, SessionStateMachine};
pub use sync::SyncGateway;
pub use tracking::{RouteTrackingOrchestrator, TrackingSettings, TrackingStatus};
