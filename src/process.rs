//! Operations written once against [`Kind`], shared by every collection.
//!
//! Each entry point resolves the owner of the resource it touches and runs the
//! authorization gate before doing any work.

use crate::auth::{authorize_resource, Identity};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::models::file::Upload;
use crate::models::{Children, Fields, Kind, Operation, Record, Relation};
use crate::registry::{Deleted, Failure};
use log::{debug, warn};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Body of a create request.
#[derive(Debug)]
pub enum Payload {
    Object(Fields),
    Uploads(Vec<Upload>),
}

impl Payload {
    pub fn from_json(body: &[u8]) -> Result<Payload> {
        match serde_json::from_slice(body) {
            Ok(Value::Object(fields)) => Ok(Payload::Object(fields)),
            Ok(_) => Err(Error::malformed("expected a JSON object")),
            Err(e) => Err(Error::malformed(format!("invalid JSON: {}", e))),
        }
    }
}

/// Identifiers committed by a create, plus what didn't make it.
#[derive(Debug, Default)]
pub struct Created {
    pub ids: Vec<Uuid>,
    pub failures: Vec<Failure>,
}

/// list/create over a top level collection or one nested under a parent.
pub struct CollectionProcessor<'a> {
    ctx: &'a Context,
    kind: Kind,
    parent: Option<(&'static Children, Uuid)>,
}

impl<'a> CollectionProcessor<'a> {
    pub fn new(ctx: &'a Context, kind: Kind) -> Self {
        CollectionProcessor {
            ctx,
            kind,
            parent: None,
        }
    }

    /// The `name` collection under `parent`, e.g. an assignment's tests.
    pub fn nested(ctx: &'a Context, parent: Kind, id: Uuid, name: &str) -> Result<Self> {
        let children = parent
            .children(name)
            .ok_or_else(|| Error::NotFound(format!("{} collection '{}'", parent, name)))?;
        Ok(CollectionProcessor {
            ctx,
            kind: children.child,
            parent: Some((children, id)),
        })
    }

    fn authorize_parent(&self, identity: &Identity, operation: Operation) -> Result<Option<Uuid>> {
        match self.parent {
            Some((children, id)) => {
                authorize_resource(&self.ctx.server, identity, children.parent, id, operation)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn list(&self, identity: &Identity) -> Result<Vec<Uuid>> {
        match self.parent {
            Some((children, id)) => {
                self.authorize_parent(identity, Operation::List)?;
                let members = self.ctx.server.members(children.parent, id, children.name)?;
                Ok(members.into_iter().collect())
            }
            None => self.ctx.server.list(self.kind),
        }
    }

    pub fn create(&self, identity: &Identity, payload: Payload) -> Result<Created> {
        let parent = self.authorize_parent(identity, Operation::Create)?;
        match payload {
            Payload::Object(fields) => {
                let record = self.create_object(identity, fields, parent)?;
                Ok(Created {
                    ids: vec![record.id],
                    failures: Vec::new(),
                })
            }
            Payload::Uploads(uploads) => {
                if self.kind != Kind::File || parent.is_some() {
                    return Err(Error::UnsupportedOperation(format!(
                        "uploading into {}",
                        self.kind.namespace()
                    )));
                }
                self.create_uploads(identity, uploads)
            }
        }
    }

    fn create_object(&self, identity: &Identity, fields: Fields, parent: Option<Uuid>) -> Result<Record> {
        let server = &self.ctx.server;
        if self.kind == Kind::Run {
            let submission = parent.ok_or_else(|| {
                Error::UnsupportedOperation("runs are created under a submission".into())
            })?;
            return self.ctx.dispatcher.submit(server, identity, submission, &fields);
        }
        server.create(self.kind, identity.id, fields, parent)
    }

    /// Archives are unpacked first, then direct uploads stored. A failed
    /// upload doesn't undo the others; the call only fails when nothing at all
    /// was created.
    fn create_uploads(&self, identity: &Identity, uploads: Vec<Upload>) -> Result<Created> {
        if uploads.is_empty() {
            return Err(Error::malformed("no files uploaded"));
        }
        let server = &self.ctx.server;
        let mut created = Created::default();
        let mut errors = Vec::new();

        let (archives, direct): (Vec<_>, Vec<_>) =
            uploads.into_iter().partition(Upload::is_archive);
        for archive in archives {
            match server.create_files(identity.id, &archive) {
                Ok((records, failures)) => {
                    created.ids.extend(records.iter().map(|record| record.id));
                    created.failures.extend(failures);
                }
                Err(e) => errors.push((archive.filename, e)),
            }
        }
        for upload in direct {
            let content_type = upload.content_type.as_deref();
            match server.create_file(
                identity.id,
                &upload.key,
                &upload.filename,
                content_type,
                &upload.content,
            ) {
                Ok(record) => created.ids.push(record.id),
                Err(e) => errors.push((upload.filename, e)),
            }
        }

        if created.ids.is_empty() {
            if let Some((_, e)) = errors.into_iter().next() {
                return Err(e);
            }
            return Ok(created);
        }
        for (name, e) in errors {
            warn!("Upload {} failed: {}", name, e);
            created.failures.push(Failure {
                name,
                message: e.to_string(),
            });
        }
        Ok(created)
    }
}

/// get/update/delete of a single resource of any kind.
pub struct ObjectProcessor<'a> {
    ctx: &'a Context,
    kind: Kind,
}

impl<'a> ObjectProcessor<'a> {
    pub fn new(ctx: &'a Context, kind: Kind) -> Self {
        ObjectProcessor { ctx, kind }
    }

    pub fn get(&self, identity: &Identity, id: Uuid) -> Result<Record> {
        authorize_resource(&self.ctx.server, identity, self.kind, id, Operation::Get)
    }

    pub fn update(&self, identity: &Identity, id: Uuid, patch: Fields) -> Result<Record> {
        authorize_resource(&self.ctx.server, identity, self.kind, id, Operation::Update)?;
        self.ctx.server.update(self.kind, id, patch)
    }

    pub fn delete(&self, identity: &Identity, id: Uuid) -> Result<Deleted> {
        authorize_resource(&self.ctx.server, identity, self.kind, id, Operation::Delete)?;
        self.ctx.server.delete(self.kind, id)
    }
}

/// Set reconciliation on one many-to-many relation.
pub struct RelationshipReconciler<'a> {
    ctx: &'a Context,
    relation: &'static Relation,
}

impl<'a> RelationshipReconciler<'a> {
    pub fn new(ctx: &'a Context, kind: Kind, name: &str) -> Result<Self> {
        let relation = kind
            .relation(name)
            .ok_or_else(|| Error::NotFound(format!("{} relation '{}'", kind, name)))?;
        Ok(RelationshipReconciler { ctx, relation })
    }

    pub fn name(&self) -> &'static str {
        self.relation.name
    }

    /// Reads `{ "<relation>": [ids...] }`.
    pub fn parse_ids(&self, body: &[u8]) -> Result<Vec<Uuid>> {
        let body: Value = serde_json::from_slice(body)
            .map_err(|e| Error::malformed(format!("invalid JSON: {}", e)))?;
        let ids = body
            .get(self.relation.name)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::malformed(format!("expected a '{}' list", self.relation.name))
            })?;
        ids.iter()
            .map(|id| {
                id.as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| Error::malformed(format!("'{}' is not an identifier", id)))
            })
            .collect()
    }

    fn members(&self, id: Uuid) -> Result<BTreeSet<Uuid>> {
        let store = self.ctx.server.store();
        Ok(store.members(self.relation.kind.namespace(), id, self.relation.name)?)
    }

    pub fn list(&self, identity: &Identity, id: Uuid) -> Result<BTreeSet<Uuid>> {
        authorize_resource(&self.ctx.server, identity, self.relation.kind, id, Operation::Get)?;
        self.members(id)
    }

    /// Adds every peer or none: a missing peer fails before anything changes.
    pub fn add(&self, identity: &Identity, id: Uuid, peers: &[Uuid]) -> Result<BTreeSet<Uuid>> {
        let relation = self.relation;
        let server = &self.ctx.server;
        authorize_resource(server, identity, relation.kind, id, Operation::Relate)?;
        for peer in peers {
            if server.try_get(relation.peer, *peer)?.is_none() {
                return Err(Error::NotFound(format!("{} {}", relation.peer, peer)));
            }
        }

        let store = server.store();
        store.add_members(relation.kind.namespace(), id, relation.name, peers)?;
        for peer in peers {
            store.add_members(relation.peer.namespace(), *peer, relation.backref, &[id])?;
        }

        // A delete that raced past the checks above would have missed these edges.
        if server.try_get(relation.kind, id)?.is_none() {
            self.unlink(id, peers)?;
            return Err(Error::NotFound(format!("{} {}", relation.kind, id)));
        }
        let mut vanished = Vec::new();
        for peer in peers {
            if server.try_get(relation.peer, *peer)?.is_none() {
                vanished.push(*peer);
            }
        }
        if !vanished.is_empty() {
            debug!("Dropping {} peer(s) deleted mid-add", vanished.len());
            return self.unlink(id, &vanished);
        }
        self.members(id)
    }

    /// Removing something that isn't there is a no-op.
    pub fn remove(&self, identity: &Identity, id: Uuid, peers: &[Uuid]) -> Result<BTreeSet<Uuid>> {
        authorize_resource(&self.ctx.server, identity, self.relation.kind, id, Operation::Relate)?;
        self.unlink(id, peers)
    }

    fn unlink(&self, id: Uuid, peers: &[Uuid]) -> Result<BTreeSet<Uuid>> {
        let relation = self.relation;
        let store = self.ctx.server.store();
        let remaining = store.remove_members(relation.kind.namespace(), id, relation.name, peers)?;
        for peer in peers {
            store.remove_members(relation.peer.namespace(), *peer, relation.backref, &[id])?;
        }
        Ok(remaining)
    }
}
