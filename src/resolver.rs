//! Binding Resolver: `(frontend, channel_id, optional thread_id) -> (thread_id,
//! agent_principal_id, working_dir)`.

use crate::db::Database;
use crate::error::{GatewayError, GatewayResult};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub thread_id: String,
    pub agent_principal_id: String,
    pub working_dir: String,
}

pub struct BindingResolver {
    db: Database,
}

impl BindingResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Never creates bindings itself; admins create them via the REST API.
    /// Never rejects based on agent liveness, so inbound ledger writes can
    /// still succeed when the agent is momentarily offline.
    pub fn resolve(
        &self,
        frontend: &str,
        channel_id: &str,
        thread_id: Option<&str>,
    ) -> GatewayResult<ResolvedTarget> {
        let binding = self
            .db
            .get_binding_by_channel(frontend, channel_id)
            .map_err(|_| GatewayError::ChannelNotBound {
                frontend: frontend.to_string(),
                channel_id: channel_id.to_string(),
            })?;

        let resolved_thread_id = match thread_id {
            Some(id) => id.to_string(),
            None => match self.db.get_thread_by_external(frontend, channel_id) {
                Ok(thread) => thread.id,
                Err(_) => Uuid::new_v4().to_string(),
            },
        };

        Ok(ResolvedTarget {
            thread_id: resolved_thread_id,
            agent_principal_id: binding.agent_principal_id,
            working_dir: binding.working_dir,
        })
    }

    /// Thread-id stability for direct (non-binding) sends: the thread id
    /// equals the agent id so repeated messages land in one conversation.
    pub fn direct_thread_id(agent_id: &str) -> String {
        agent_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PrincipalKind, PrincipalStatus};

    fn setup() -> (Database, BindingResolver) {
        let db = Database::open_in_memory().unwrap();
        db.create_principal("p1", PrincipalKind::Agent, "fp1", "Agent", PrincipalStatus::Approved)
            .unwrap();
        db.create_binding("b1", "matrix", "!room", "p1", "/w", None).unwrap();
        let resolver = BindingResolver::new(db.clone());
        (db, resolver)
    }

    #[test]
    fn resolve_missing_binding_errors() {
        let (_db, resolver) = setup();
        let err = resolver.resolve("matrix", "!unknown", None).unwrap_err();
        assert!(matches!(err, GatewayError::ChannelNotBound { .. }));
    }

    #[test]
    fn resolve_synthesizes_thread_on_first_call_then_stabilizes() {
        let (db, resolver) = setup();
        let first = resolver.resolve("matrix", "!room", None).unwrap();
        db.get_or_create_thread("matrix", "!room", "p1", &first.thread_id).unwrap();
        let second = resolver.resolve("matrix", "!room", None).unwrap();
        assert_eq!(first.thread_id, second.thread_id);
    }

    #[test]
    fn explicit_thread_id_passes_through() {
        let (_db, resolver) = setup();
        let resolved = resolver.resolve("matrix", "!room", Some("t-explicit")).unwrap();
        assert_eq!(resolved.thread_id, "t-explicit");
    }
}
