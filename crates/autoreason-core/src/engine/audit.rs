use crate::db::{IsolationLevel, ReasonDb};
use crate::error::Result;
use crate::types::RevisionId;

const SERVICE_NAME: &str = "AutoReason";
const TRANSACTION_NAME: &str = "AutoReason.CreateRevision";

/// Holds the revision of the running cycle.
#[derive(Debug, Clone)]
pub struct AuditRecordManager {
    enabled: bool,
    application: String,
    computer: String,
    service_id: Option<u64>,
    current: Option<RevisionId>,
}

impl AuditRecordManager {
    pub fn new(enabled: bool, application: impl Into<String>, computer: impl Into<String>) -> Self {
        Self {
            enabled,
            application: application.into(),
            computer: computer.into(),
            service_id: None,
            current: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn current(&self) -> Option<RevisionId> {
        self.current
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    /// The cycle's revision, created in its own transaction on first use.
    /// `None` when tracking is disabled.
    pub fn get_or_create(&mut self, db: &ReasonDb) -> Result<Option<RevisionId>> {
        if !self.enabled {
            return Ok(None);
        }
        if let Some(current) = self.current {
            return Ok(Some(current));
        }
        let tx = db.begin_transaction(TRANSACTION_NAME, IsolationLevel::ReadCommitted)?;
        let service_id = match self.service_id {
            Some(id) => id,
            None => {
                tx.get_or_create_service(SERVICE_NAME, &self.computer, &self.application)?
                    .id
            }
        };
        let revision = tx.create_revision(service_id, &self.application)?;
        tx.commit()?;

        tracing::debug!(revision = %revision.id, service = service_id, "revision created");
        self.service_id = Some(service_id);
        self.current = Some(revision.id);
        Ok(self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::open_tmp;

    #[test]
    fn disabled_manager_never_creates() {
        let (_dir, db) = open_tmp();
        let mut audit = AuditRecordManager::new(false, "autoreason", "host");
        assert_eq!(audit.get_or_create(&db).unwrap(), None);
        assert!(db.list_revisions().unwrap().is_empty());
    }

    #[test]
    fn one_revision_per_cycle_and_cleared_between_cycles() {
        let (_dir, db) = open_tmp();
        let mut audit = AuditRecordManager::new(true, "autoreason", "host");
        let first = audit.get_or_create(&db).unwrap().unwrap();
        assert_eq!(audit.get_or_create(&db).unwrap(), Some(first));
        audit.clear();
        assert_eq!(audit.current(), None);
        let second = audit.get_or_create(&db).unwrap().unwrap();
        assert_ne!(first, second);

        let revisions = db.list_revisions().unwrap();
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[0].service_id, revisions[1].service_id);
        assert_eq!(revisions[0].application, "autoreason");
    }
}
