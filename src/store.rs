use crossbeam_skiplist::map::Entry;
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use rmpv::Value;
use std::ops::Bound;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::connection::PRIMARY_INDEX;
use crate::proto::{errcode, IteratorType, Request};
use crate::{Error, Result};

pub type Tuple = Vec<Value>;

/// Tuples of one space ordered by their primary key, tuple field 0.
#[derive(Default)]
struct Space {
    rows: SkipMap<String, Tuple>,

    /// Serializes writers so that a duplicate check and the insert following
    /// it see the same state. Readers never take it.
    writer: Mutex<()>,
}

/// An in-memory tuple store holding a fixed set of spaces.
///
/// Cloning is cheap; clones share the same spaces.
#[derive(Clone, Default)]
pub struct TupleStore {
    spaces: Arc<DashMap<u32, Arc<Space>>>,
}

impl TupleStore {
    pub fn with_spaces<I: IntoIterator<Item = u32>>(ids: I) -> TupleStore {
        let store = TupleStore::default();
        for id in ids {
            store.create_space(id);
        }
        store
    }

    pub fn create_space(&self, id: u32) {
        self.spaces.entry(id).or_default();
    }

    pub fn space_len(&self, id: u32) -> Option<usize> {
        self.spaces.get(&id).map(|space| space.rows.len())
    }

    /// Run a decoded request and return the tuples it produced.
    pub fn execute(&self, request: Request) -> Result<Vec<Value>> {
        debug!(?request, "Executing request");
        let tuples = match request {
            Request::Select {
                space,
                index,
                key,
                iterator,
                limit,
                offset,
            } => self.select(space, index, &key, iterator, limit, offset)?,
            Request::Insert { space, tuple } => vec![self.insert(space, tuple)?],
            Request::Replace { space, tuple } => vec![self.replace(space, tuple)?],
            Request::Delete { space, index, key } => {
                self.delete(space, index, &key)?.into_iter().collect()
            }
            Request::Ping => Vec::new(),
        };
        Ok(tuples.into_iter().map(Value::Array).collect())
    }

    pub fn select(
        &self,
        space_id: u32,
        index: u32,
        key: &[Value],
        iterator: IteratorType,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Tuple>> {
        let space = self.space(space_id)?;
        check_index(space_id, index)?;
        let key = match key.first() {
            Some(part) => Some(key_string(part)?),
            None => None,
        };
        let rows = &space.rows;
        let tuples = match (iterator, key) {
            (IteratorType::Eq | IteratorType::Req, Some(key)) => {
                page(rows.get(&key).into_iter(), offset, limit)
            }
            (IteratorType::Lt | IteratorType::Le | IteratorType::Req, None) => {
                page(rows.iter().rev(), offset, limit)
            }
            (_, None) | (IteratorType::All, Some(_)) => page(rows.iter(), offset, limit),
            (IteratorType::Ge, Some(key)) => page(rows.range(key..), offset, limit),
            (IteratorType::Gt, Some(key)) => page(
                rows.range((Bound::Excluded(key), Bound::Unbounded)),
                offset,
                limit,
            ),
            (IteratorType::Lt, Some(key)) => page(rows.range(..key).rev(), offset, limit),
            (IteratorType::Le, Some(key)) => page(rows.range(..=key).rev(), offset, limit),
        };
        Ok(tuples)
    }

    /// Store a new tuple. A tuple with the same key must not exist yet.
    pub fn insert(&self, space_id: u32, tuple: Tuple) -> Result<Tuple> {
        let space = self.space(space_id)?;
        let key = tuple_key(&tuple)?;
        let _writer = space.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if space.rows.contains_key(&key) {
            return Err(Error::Store {
                code: errcode::TUPLE_FOUND,
                message: format!(
                    "Duplicate key exists in unique index 'primary' in space '{space_id}'"
                ),
            });
        }
        space.rows.insert(key, tuple.clone());
        Ok(tuple)
    }

    /// Store a tuple, dropping whatever was stored under its key.
    pub fn replace(&self, space_id: u32, tuple: Tuple) -> Result<Tuple> {
        let space = self.space(space_id)?;
        let key = tuple_key(&tuple)?;
        let _writer = space.writer.lock().unwrap_or_else(PoisonError::into_inner);
        space.rows.insert(key, tuple.clone());
        Ok(tuple)
    }

    /// Remove the tuple stored under `key`, returning it if there was one.
    pub fn delete(&self, space_id: u32, index: u32, key: &[Value]) -> Result<Option<Tuple>> {
        let space = self.space(space_id)?;
        check_index(space_id, index)?;
        let key = match key.first() {
            Some(part) => key_string(part)?,
            None => {
                return Err(Error::Store {
                    code: errcode::ILLEGAL_PARAMS,
                    message: "Delete requires a key".to_string(),
                })
            }
        };
        let _writer = space.writer.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(space.rows.remove(&key).map(|entry| entry.value().clone()))
    }

    fn space(&self, id: u32) -> Result<Arc<Space>> {
        self.spaces
            .get(&id)
            .map(|space| Arc::clone(space.value()))
            .ok_or_else(|| Error::Store {
                code: errcode::NO_SUCH_SPACE,
                message: format!("Space '{id}' does not exist"),
            })
    }
}

fn page<'a, I>(rows: I, offset: u32, limit: u32) -> Vec<Tuple>
where
    I: Iterator<Item = Entry<'a, String, Tuple>>,
{
    rows.skip(offset as usize)
        .take(limit as usize)
        .map(|entry| entry.value().clone())
        .collect()
}

fn check_index(space_id: u32, index: u32) -> Result<()> {
    if index == PRIMARY_INDEX {
        Ok(())
    } else {
        Err(Error::Store {
            code: errcode::NO_SUCH_INDEX,
            message: format!("No index #{index} is defined in space '{space_id}'"),
        })
    }
}

fn key_string(part: &Value) -> Result<String> {
    part.as_str().map(str::to_string).ok_or_else(|| Error::Store {
        code: errcode::FIELD_TYPE,
        message: format!("Supplied key type of part 0 does not match index part type: expected string, got {part}"),
    })
}

fn tuple_key(tuple: &Tuple) -> Result<String> {
    match tuple.first() {
        Some(part) => key_string(part),
        None => Err(Error::Store {
            code: errcode::FIELD_TYPE,
            message: "Tuple field 1 required by space format is missing".to_string(),
        }),
    }
}
