use crate::models::Record;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{namespace}/{id} already exists")]
    Conflict { namespace: &'static str, id: Uuid },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value persistence the registry runs against.
///
/// Records live in collection scoped namespaces, edge sets are keyed by
/// (namespace, id, relation) and unique indexes map a string key to an id.
/// Every method is atomic with respect to the single key it touches.
pub trait Store: Send + Sync {
    fn insert(&self, namespace: &'static str, record: Record) -> StoreResult<()>;
    fn get(&self, namespace: &'static str, id: Uuid) -> StoreResult<Option<Record>>;
    /// Identifiers in the namespace, sorted.
    fn ids(&self, namespace: &'static str) -> StoreResult<Vec<Uuid>>;
    /// Applies `change` while holding the record's lock. `None` if absent.
    fn modify(
        &self,
        namespace: &'static str,
        id: Uuid,
        change: &mut dyn FnMut(&mut Record),
    ) -> StoreResult<Option<Record>>;
    fn remove(&self, namespace: &'static str, id: Uuid) -> StoreResult<Option<Record>>;

    fn members(&self, namespace: &'static str, id: Uuid, relation: &'static str)
        -> StoreResult<BTreeSet<Uuid>>;
    fn add_members(
        &self,
        namespace: &'static str,
        id: Uuid,
        relation: &'static str,
        members: &[Uuid],
    ) -> StoreResult<BTreeSet<Uuid>>;
    fn remove_members(
        &self,
        namespace: &'static str,
        id: Uuid,
        relation: &'static str,
        members: &[Uuid],
    ) -> StoreResult<BTreeSet<Uuid>>;
    /// Drops the whole set, returning what it held.
    fn clear_members(
        &self,
        namespace: &'static str,
        id: Uuid,
        relation: &'static str,
    ) -> StoreResult<BTreeSet<Uuid>>;

    fn index_get(&self, index: &'static str, key: &str) -> StoreResult<Option<Uuid>>;
    /// Binds `key` to `id` unless already bound; returns the id that ends up bound.
    fn index_claim(&self, index: &'static str, key: &str, id: Uuid) -> StoreResult<Uuid>;
    fn index_remove(&self, index: &'static str, key: &str) -> StoreResult<()>;
}

type SetKey = (&'static str, Uuid, &'static str);

/// In-process store, each map shard lock serializing access to its keys.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<(&'static str, Uuid), Record>,
    sets: DashMap<SetKey, BTreeSet<Uuid>>,
    indexes: DashMap<(&'static str, String), Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert(&self, namespace: &'static str, record: Record) -> StoreResult<()> {
        match self.records.entry((namespace, record.id)) {
            Entry::Occupied(_) => Err(StoreError::Conflict {
                namespace,
                id: record.id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn get(&self, namespace: &'static str, id: Uuid) -> StoreResult<Option<Record>> {
        Ok(self
            .records
            .get(&(namespace, id))
            .map(|record| record.value().clone()))
    }

    fn ids(&self, namespace: &'static str) -> StoreResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == namespace)
            .map(|entry| entry.key().1)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn modify(
        &self,
        namespace: &'static str,
        id: Uuid,
        change: &mut dyn FnMut(&mut Record),
    ) -> StoreResult<Option<Record>> {
        Ok(self.records.get_mut(&(namespace, id)).map(|mut record| {
            change(record.value_mut());
            record.value().clone()
        }))
    }

    fn remove(&self, namespace: &'static str, id: Uuid) -> StoreResult<Option<Record>> {
        Ok(self.records.remove(&(namespace, id)).map(|(_, record)| record))
    }

    fn members(
        &self,
        namespace: &'static str,
        id: Uuid,
        relation: &'static str,
    ) -> StoreResult<BTreeSet<Uuid>> {
        Ok(self
            .sets
            .get(&(namespace, id, relation))
            .map(|set| set.value().clone())
            .unwrap_or_default())
    }

    fn add_members(
        &self,
        namespace: &'static str,
        id: Uuid,
        relation: &'static str,
        members: &[Uuid],
    ) -> StoreResult<BTreeSet<Uuid>> {
        let mut set = self.sets.entry((namespace, id, relation)).or_default();
        set.extend(members.iter().copied());
        Ok(set.value().clone())
    }

    fn remove_members(
        &self,
        namespace: &'static str,
        id: Uuid,
        relation: &'static str,
        members: &[Uuid],
    ) -> StoreResult<BTreeSet<Uuid>> {
        match self.sets.get_mut(&(namespace, id, relation)) {
            Some(mut set) => {
                for member in members {
                    set.remove(member);
                }
                Ok(set.value().clone())
            }
            None => Ok(BTreeSet::new()),
        }
    }

    fn clear_members(
        &self,
        namespace: &'static str,
        id: Uuid,
        relation: &'static str,
    ) -> StoreResult<BTreeSet<Uuid>> {
        Ok(self
            .sets
            .remove(&(namespace, id, relation))
            .map(|(_, set)| set)
            .unwrap_or_default())
    }

    fn index_get(&self, index: &'static str, key: &str) -> StoreResult<Option<Uuid>> {
        Ok(self
            .indexes
            .get(&(index, key.to_string()))
            .map(|id| *id.value()))
    }

    fn index_claim(&self, index: &'static str, key: &str, id: Uuid) -> StoreResult<Uuid> {
        Ok(*self
            .indexes
            .entry((index, key.to_string()))
            .or_insert(id)
            .value())
    }

    fn index_remove(&self, index: &'static str, key: &str) -> StoreResult<()> {
        self.indexes.remove(&(index, key.to_string()));
        Ok(())
    }
}
