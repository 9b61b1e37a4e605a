use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::Serialize;

use crate::error::{AutoReasonError, Result};
use crate::filter::MachineFilter;
use crate::types::{
    Equipment, ModificationId, Module, NewReasonAssignment, Reason, ReasonAssignment, Revision,
    RevisionId, Service,
};

use super::{
    assignment_key, cursor_table_key, decode, CursorRecord, IsolationLevel, ASSIGNMENTS, CURSORS,
    EQUIPMENT, MACHINE_FILTERS, REASONS, REVISIONS, SEQUENCES, SERVICES,
};

const SEQ_EQUIPMENT: &str = "equipment";
const SEQ_MODULE: &str = "module";
const SEQ_REASON: &str = "reason";
const SEQ_FILTER: &str = "machine_filter";
const SEQ_MODIFICATION: &str = "modification";
const SEQ_REVISION: &str = "revision";
const SEQ_SERVICE: &str = "service";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// An open write transaction.
///
/// Writes become visible only after [`DbTransaction::commit`]. Dropping the
/// value without committing aborts the transaction.
pub struct DbTransaction {
    inner: WriteTransaction,
    name: String,
    isolation: IsolationLevel,
}

impl DbTransaction {
    pub(super) fn new(inner: WriteTransaction, name: &str, isolation: IsolationLevel) -> Self {
        Self {
            inner,
            name: name.to_string(),
            isolation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn commit(self) -> Result<()> {
        tracing::trace!(transaction = %self.name, "commit");
        self.inner.commit().map_err(AutoReasonError::db)
    }

    fn next_id(&self, sequence: &str) -> Result<u64> {
        let mut table = self
            .inner
            .open_table(SEQUENCES)
            .map_err(AutoReasonError::db)?;
        let current = table
            .get(sequence)
            .map_err(AutoReasonError::db)?
            .map(|g| g.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(sequence, next).map_err(AutoReasonError::db)?;
        Ok(next)
    }

    fn put(
        &self,
        def: redb::TableDefinition<'static, u64, &'static [u8]>,
        id: u64,
        value: &impl Serialize,
    ) -> Result<()> {
        let bytes = encode(value)?;
        let mut table = self.inner.open_table(def).map_err(AutoReasonError::db)?;
        table
            .insert(id, bytes.as_slice())
            .map_err(AutoReasonError::db)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Configuration entities
    // -----------------------------------------------------------------------

    pub(crate) fn insert_equipment(
        &self,
        name: &str,
        category: Option<&str>,
        module_names: &[String],
    ) -> Result<Equipment> {
        let id = self.next_id(SEQ_EQUIPMENT)?;
        let mut modules = Vec::with_capacity(module_names.len());
        for module_name in module_names {
            modules.push(Module {
                id: self.next_id(SEQ_MODULE)?,
                name: module_name.clone(),
            });
        }
        let equipment = Equipment {
            id,
            name: name.to_string(),
            category: category.map(str::to_string),
            modules,
        };
        self.put(EQUIPMENT, id, &equipment)?;
        Ok(equipment)
    }

    pub(crate) fn insert_reason(
        &self,
        code: &str,
        display: &str,
        translation_key: Option<&str>,
        default_score: f64,
    ) -> Result<Reason> {
        let id = self.next_id(SEQ_REASON)?;
        let reason = Reason {
            id,
            code: code.to_string(),
            display: display.to_string(),
            translation_key: translation_key.map(str::to_string),
            default_score,
        };
        self.put(REASONS, id, &reason)?;
        Ok(reason)
    }

    pub(crate) fn find_reason_by_translation_key(&self, translation_key: &str) -> Result<Option<Reason>> {
        let table = self.inner.open_table(REASONS).map_err(AutoReasonError::db)?;
        for entry in table.iter().map_err(AutoReasonError::db)? {
            let (_, v) = entry.map_err(AutoReasonError::db)?;
            let reason: Reason = decode(v.value())?;
            if reason.translation_key.as_deref() == Some(translation_key) {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    pub(crate) fn insert_machine_filter(&self, mut filter: MachineFilter) -> Result<MachineFilter> {
        filter.id = self.next_id(SEQ_FILTER)?;
        self.put(MACHINE_FILTERS, filter.id, &filter)?;
        Ok(filter)
    }

    // -----------------------------------------------------------------------
    // Engine writes
    // -----------------------------------------------------------------------

    /// Insert a reason assignment and return it with its modification id.
    pub fn insert_reason_assignment(&self, new: NewReasonAssignment) -> Result<ReasonAssignment> {
        let id = ModificationId(self.next_id(SEQ_MODIFICATION)?);
        let assignment = ReasonAssignment::from_new(id, new);
        self.write_assignment(&assignment)?;
        Ok(assignment)
    }

    fn write_assignment(&self, assignment: &ReasonAssignment) -> Result<()> {
        let key = assignment_key(assignment.equipment_id, assignment.range.begin, assignment.id.0);
        let bytes = encode(assignment)?;
        let mut table = self
            .inner
            .open_table(ASSIGNMENTS)
            .map_err(AutoReasonError::db)?;
        table
            .insert(key.as_slice(), bytes.as_slice())
            .map_err(AutoReasonError::db)?;
        Ok(())
    }

    /// Insert or replace the cursor `key` of `equipment_id`.
    pub fn save_cursor(&self, equipment_id: u64, key: &str, at: DateTime<Utc>) -> Result<()> {
        let record = CursorRecord {
            equipment_id,
            key: key.to_string(),
            at,
            updated_at: Utc::now(),
        };
        let bytes = encode(&record)?;
        let table_key = cursor_table_key(equipment_id, key);
        let mut table = self.inner.open_table(CURSORS).map_err(AutoReasonError::db)?;
        table
            .insert(table_key.as_str(), bytes.as_slice())
            .map_err(AutoReasonError::db)?;
        Ok(())
    }

    /// Find the service registered for (`computer`, `program`) or create it.
    pub fn get_or_create_service(&self, name: &str, computer: &str, program: &str) -> Result<Service> {
        let mut matching = Vec::new();
        {
            let table = self.inner.open_table(SERVICES).map_err(AutoReasonError::db)?;
            for entry in table.iter().map_err(AutoReasonError::db)? {
                let (_, v) = entry.map_err(AutoReasonError::db)?;
                let service: Service = decode(v.value())?;
                if service.computer == computer && service.program == program {
                    matching.push(service);
                }
            }
        }
        if matching.len() > 1 {
            tracing::error!(computer, program, count = matching.len(), "more than one service matches");
        }
        if let Some(service) = matching.into_iter().next() {
            return Ok(service);
        }
        let service = Service {
            id: self.next_id(SEQ_SERVICE)?,
            name: name.to_string(),
            computer: computer.to_string(),
            program: program.to_string(),
        };
        self.put(SERVICES, service.id, &service)?;
        Ok(service)
    }

    pub fn create_revision(&self, service_id: u64, application: &str) -> Result<Revision> {
        let revision = Revision {
            id: RevisionId(self.next_id(SEQ_REVISION)?),
            service_id,
            application: application.to_string(),
            created_at: Utc::now(),
            modifications: Vec::new(),
        };
        self.put(REVISIONS, revision.id.0, &revision)?;
        Ok(revision)
    }

    /// Link `assignment` to `revision`, updating both records.
    pub fn add_modification(
        &self,
        revision: RevisionId,
        assignment: &ReasonAssignment,
    ) -> Result<ReasonAssignment> {
        let mut record: Revision = {
            let table = self
                .inner
                .open_table(REVISIONS)
                .map_err(AutoReasonError::db)?;
            let guard = table.get(revision.0).map_err(AutoReasonError::db)?;
            match guard {
                Some(g) => decode(g.value())?,
                None => {
                    return Err(AutoReasonError::Db(format!(
                        "revision not found: {revision}"
                    )))
                }
            }
        };
        record.modifications.push(assignment.id);
        self.put(REVISIONS, revision.0, &record)?;

        let mut linked = assignment.clone();
        linked.revision_id = Some(revision);
        self.write_assignment(&linked)?;
        Ok(linked)
    }
}
