use crate::error::{Error, Result};
use crate::models::file::{extract_members, FileStorage, Upload};
use crate::models::run::{self, RunResult, RunStatus};
use crate::models::{Fields, Kind, Operation, Record, CHILDREN};
use crate::store::Store;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// A sub-operation of a batch that didn't go through.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Failure {
    pub name: String,
    pub message: String,
}

/// Outcome of a delete, including everything it took down with it.
#[derive(Debug)]
pub struct Deleted {
    pub record: Record,
    pub cascaded: Vec<Uuid>,
    pub failures: Vec<Failure>,
}

pub fn not_found(kind: Kind, id: Uuid) -> Error {
    Error::NotFound(format!("{} {}", kind, id))
}

/// Root catalogue of every collection, backed by a [`Store`].
#[derive(Clone)]
pub struct Server {
    store: Arc<dyn Store>,
    files: FileStorage,
}

impl Server {
    pub fn new(store: Arc<dyn Store>, files: FileStorage) -> Self {
        Server { store, files }
    }

    pub fn store(&self) -> &dyn Store {
        &*self.store
    }

    pub fn files(&self) -> &FileStorage {
        &self.files
    }

    pub fn list(&self, kind: Kind) -> Result<Vec<Uuid>> {
        Ok(self.store.ids(kind.namespace())?)
    }

    pub fn try_get(&self, kind: Kind, id: Uuid) -> Result<Option<Record>> {
        Ok(self.store.get(kind.namespace(), id)?)
    }

    pub fn get(&self, kind: Kind, id: Uuid) -> Result<Record> {
        self.try_get(kind, id)?.ok_or_else(|| not_found(kind, id))
    }

    /// Members of one of the resource's sets, failing if the resource is gone.
    pub fn members(&self, kind: Kind, id: Uuid, set: &'static str) -> Result<BTreeSet<Uuid>> {
        self.get(kind, id)?;
        Ok(self.store.members(kind.namespace(), id, set)?)
    }

    /// Rejects unknown field names, and on create also missing required ones.
    pub fn validate_fields(kind: Kind, fields: &Fields, creating: bool) -> Result<()> {
        let schema = kind.schema();
        for name in fields.keys() {
            let name = name.as_str();
            let allowed = schema.writable.contains(&name)
                || (creating && schema.create_only.contains(&name));
            if !allowed {
                return Err(Error::malformed(format!("unknown {} field '{}'", kind, name)));
            }
        }
        if creating {
            for required in schema.required {
                if !fields.contains_key(*required) {
                    return Err(Error::malformed(format!(
                        "missing required {} field '{}'",
                        kind, required
                    )));
                }
            }
        }
        Ok(())
    }

    /// Creates a resource from client supplied fields.
    pub fn create(
        &self,
        kind: Kind,
        owner: Uuid,
        fields: Fields,
        parent: Option<Uuid>,
    ) -> Result<Record> {
        match kind {
            Kind::File => {
                return Err(Error::UnsupportedOperation(
                    "files are created by uploading them".into(),
                ))
            }
            Kind::Run => {
                return Err(Error::UnsupportedOperation(
                    "runs are created by dispatching a submission".into(),
                ))
            }
            _ if !kind.supports(Operation::Create) => {
                return Err(Error::UnsupportedOperation(format!("creating a {}", kind)))
            }
            _ => {}
        }
        Self::validate_fields(kind, &fields, true)?;
        self.insert(kind, Record::new(Some(owner), fields), parent)
    }

    /// Stores a record and links it into its parent's containment set.
    pub(crate) fn insert(&self, kind: Kind, mut record: Record, parent: Option<Uuid>) -> Result<Record> {
        match (kind.parent(), parent) {
            (Some(children), Some(parent)) => {
                self.get(children.parent, parent)?;
                record.fields.insert(
                    children.parent_field.into(),
                    Value::from(parent.to_string()),
                );
                self.store.insert(kind.namespace(), record.clone())?;
                self.store.add_members(
                    children.parent.namespace(),
                    parent,
                    children.name,
                    &[record.id],
                )?;

                // A parent delete that ran between the check above and the
                // link never saw this child in its cascade.
                if self.try_get(children.parent, parent)?.is_none() {
                    self.store.remove(kind.namespace(), record.id)?;
                    self.store
                        .clear_members(children.parent.namespace(), parent, children.name)?;
                    debug!("Dropped {} {}, its {} went away", kind, record.id, children.parent);
                    return Err(not_found(children.parent, parent));
                }
            }
            (None, None) => self.store.insert(kind.namespace(), record.clone())?,
            (Some(children), None) => {
                return Err(Error::UnsupportedOperation(format!(
                    "{}s are created under a {}",
                    kind, children.parent
                )))
            }
            (None, Some(_)) => {
                return Err(Error::UnsupportedOperation(format!(
                    "{}s are not created under another resource",
                    kind
                )))
            }
        }
        debug!("Created {} {}", kind, record.id);
        Ok(record)
    }

    pub fn create_file(
        &self,
        owner: Uuid,
        key: &str,
        name: &str,
        content_type: Option<&str>,
        content: &[u8],
    ) -> Result<Record> {
        let id = Uuid::new_v4();
        let fields = self.files.save(id, key, name, content_type, content)?;
        let record = Record {
            id,
            owner: Some(owner),
            fields,
        };
        match self.insert(Kind::File, record, None) {
            Ok(record) => Ok(record),
            Err(e) => {
                self.files.remove(id)?;
                Err(e)
            }
        }
    }

    /// One file per archive member. Members that fail are reported, the rest
    /// are kept.
    pub fn create_files(&self, owner: Uuid, upload: &Upload) -> Result<(Vec<Record>, Vec<Failure>)> {
        let members = extract_members(&upload.content).map_err(|e| {
            Error::malformed(format!("'{}' is not a readable archive: {}", upload.filename, e))
        })?;

        let mut created = Vec::new();
        let mut failures = Vec::new();
        for member in members {
            let outcome = match member.content {
                Ok(content) => self.create_file(owner, &upload.key, &member.name, None, &content),
                Err(e) => Err(Error::from(e)),
            };
            match outcome {
                Ok(record) => created.push(record),
                Err(e) => {
                    warn!("Skipping archive member {}: {}", member.name, e);
                    failures.push(Failure {
                        name: member.name,
                        message: e.to_string(),
                    });
                }
            }
        }
        info!(
            "Extracted {} file(s) from {} ({} failed)",
            created.len(),
            upload.filename,
            failures.len()
        );
        Ok((created, failures))
    }

    /// Merges `patch` into the resource atomically.
    pub fn update(&self, kind: Kind, id: Uuid, patch: Fields) -> Result<Record> {
        if !kind.supports(Operation::Update) {
            return Err(Error::UnsupportedOperation(format!("updating a {}", kind)));
        }
        Self::validate_fields(kind, &patch, false)?;
        self.store
            .modify(kind.namespace(), id, &mut |record| {
                for (name, value) in patch.iter() {
                    record.fields.insert(name.clone(), value.clone());
                }
            })?
            .ok_or_else(|| not_found(kind, id))
    }

    /// Removes the resource and every reference to it.
    ///
    /// Assignments take their tests and submissions down with them, and
    /// submissions their runs.
    pub fn delete(&self, kind: Kind, id: Uuid) -> Result<Deleted> {
        if !kind.supports(Operation::Delete) {
            return Err(Error::UnsupportedOperation(format!("deleting a {}", kind)));
        }
        let record = self
            .store
            .remove(kind.namespace(), id)?
            .ok_or_else(|| not_found(kind, id))?;
        let mut deleted = Deleted {
            record,
            cascaded: Vec::new(),
            failures: Vec::new(),
        };
        self.detach(kind, id, &mut deleted)?;
        debug!("Deleted {} {}", kind, id);
        Ok(deleted)
    }

    fn detach(&self, kind: Kind, id: Uuid, deleted: &mut Deleted) -> Result<()> {
        let namespace = kind.namespace();

        if let Some(children) = kind.parent() {
            if let Some(parent) = deleted.record.field_uuid(children.parent_field) {
                self.store.remove_members(
                    children.parent.namespace(),
                    parent,
                    children.name,
                    &[id],
                )?;
            }
        }

        for relation in kind.relations() {
            for peer in self.store.clear_members(namespace, id, relation.name)? {
                self.store
                    .remove_members(relation.peer.namespace(), peer, relation.backref, &[id])?;
            }
        }

        for relation in kind.referenced_by() {
            for holder in self.store.clear_members(namespace, id, relation.backref)? {
                self.store
                    .remove_members(relation.kind.namespace(), holder, relation.name, &[id])?;
            }
        }

        for children in CHILDREN.iter().filter(|children| children.parent == kind) {
            for child in self.store.clear_members(namespace, id, children.name)? {
                match self.delete(children.child, child) {
                    Ok(removed) => {
                        deleted.cascaded.push(child);
                        deleted.cascaded.extend(removed.cascaded);
                        deleted.failures.extend(removed.failures);
                    }
                    Err(Error::NotFound(_)) => {}
                    Err(e) => {
                        warn!("Cascade from {} {} to {} failed: {}", kind, id, child, e);
                        deleted.failures.push(Failure {
                            name: child.to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        if kind == Kind::File {
            if let Err(e) = self.files.remove(id) {
                warn!("Couldn't remove content of file {}: {}", id, e);
                deleted.failures.push(Failure {
                    name: id.to_string(),
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Moves a run forward. `None` if the run is gone, otherwise whether the
    /// transition was allowed.
    pub fn advance_run(
        &self,
        id: Uuid,
        next: RunStatus,
        result: Option<&RunResult>,
    ) -> Result<Option<bool>> {
        let mut advanced = false;
        let record = self.store.modify(Kind::Run.namespace(), id, &mut |record| {
            advanced = run::advance(record, next, result);
        })?;
        Ok(record.map(|_| advanced))
    }
}
