//! Incident reports filed by the driver.

use std::sync::Arc;

use chrono::Local;
use tracing::{info, warn};

use crate::{IncidentError, IncidentReport, IncidentType, SessionStateMachine, SyncGateway};

// ---

/// Files incident reports under `incidencias`.
pub struct IncidentReporter {
    session: Arc<SessionStateMachine>,
    gateway: Arc<SyncGateway>,
}

impl IncidentReporter {
    pub fn new(session: Arc<SessionStateMachine>, gateway: Arc<SyncGateway>) -> Self {
        Self { session, gateway }
    }

    /// File a report stamped with the local date and time, returning its key.
    ///
    /// Vehicle fields are taken from the active assignment when there is one.
    pub async fn submit_incident(
        &self,
        kind: IncidentType,
        description: &str,
    ) -> Result<String, IncidentError> {
        // ---
        let description = description.trim();
        if description.is_empty() {
            return Err(IncidentError::EmptyDescription);
        }

        let Some(conductor) = self.session.conductor() else {
            warn!("Incident submitted with no session");
            return Err(IncidentError::NoSession);
        };

        let assignment = self.session.assignment();
        let report = IncidentReport::new(kind, description, assignment.as_ref(), Local::now());

        let key = self
            .gateway
            .append_incident(&report)
            .await
            .ok_or(IncidentError::RemoteWriteFailure)?;

        info!("Incident {} ({:?}) filed by {}", key, kind, conductor.uid);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::memory::{MemoryIdentity, MemoryStore};
    use serde_json::{json, Value};

    async fn reporter(data: Value, login: bool) -> (IncidentReporter, Arc<MemoryStore>) {
        // ---
        let store = Arc::new(MemoryStore::with_data(data));
        let identity = Arc::new(MemoryIdentity::new().with_account("ana@x.com", "pw", "u1"));
        let session = Arc::new(SessionStateMachine::new(identity.clone(), store.clone(), None));
        if login {
            session.login("ana@x.com", "pw").await.unwrap();
        }
        let gateway = Arc::new(SyncGateway::new(identity, store.clone()));
        (IncidentReporter::new(session, gateway), store)
    }

    fn with_assignment() -> Value {
        json!({
            "conductores": { "u1": { "nombre": "Ana" } },
            "asignaciones": {
                "a1": { "id_conductor": "u1", "id_vehiculo": "v7", "matricula_vehiculo": "9876XYZ" }
            }
        })
    }

    #[tokio::test]
    async fn report_carries_vehicle_of_active_assignment() {
        // ---
        let (reporter, store) = reporter(with_assignment(), true).await;

        let key = reporter
            .submit_incident(IncidentType::Accident, "  minor scrape  ")
            .await
            .unwrap();
        let stored = store.snapshot(&format!("incidencias/{key}")).unwrap();

        assert_eq!(stored["tipo"], json!("Accidente"));
        assert_eq!(stored["descripcion"], json!("minor scrape"));
        assert_eq!(stored["id_vehiculo"], json!("v7"));
        assert_eq!(stored["matricula"], json!("9876XYZ"));
        assert_eq!(stored["fecha"].as_str().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn report_without_assignment_omits_vehicle() {
        // ---
        let (reporter, store) =
            reporter(json!({ "conductores": { "u1": { "nombre": "Ana" } } }), true).await;

        let key = reporter
            .submit_incident(IncidentType::Maintenance, "oil change due")
            .await
            .unwrap();
        let stored = store.snapshot(&format!("incidencias/{key}")).unwrap();
        let fields = stored.as_object().unwrap();

        assert!(!fields.contains_key("id_vehiculo"));
        assert!(!fields.contains_key("matricula"));
    }

    #[tokio::test]
    async fn validation_and_failures() {
        // ---
        let (logged_out, _) = reporter(with_assignment(), false).await;
        assert_eq!(
            logged_out.submit_incident(IncidentType::Other, "   ").await,
            Err(IncidentError::EmptyDescription)
        );
        assert_eq!(
            logged_out.submit_incident(IncidentType::Other, "x").await,
            Err(IncidentError::NoSession)
        );

        let (reporter, store) = reporter(with_assignment(), true).await;
        store.set_unavailable(true);
        assert_eq!(
            reporter.submit_incident(IncidentType::Breakdown, "won't start").await,
            Err(IncidentError::RemoteWriteFailure)
        );
    }
}
