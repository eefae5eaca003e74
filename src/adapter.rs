use rmpv::Value;
use std::collections::{HashSet, VecDeque};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::config::{Config, Properties};
use crate::connection::Connection;
use crate::proto::IteratorType;
use crate::tuple::{from_tuple, to_tuple, Record};
use crate::{Error, Result};

/// Translates keyed records into tuples of a remote tuple store.
///
/// The adapter owns one connection. Requests from concurrent callers are
/// serialized on it, so a single adapter can be shared between tasks.
#[derive(Debug)]
pub struct StoreAdapter {
    config: Config,
    connection: Mutex<Option<Connection>>,
}

impl StoreAdapter {
    /// Resolve the configuration from harness properties and connect.
    pub async fn init(props: &Properties) -> Result<StoreAdapter> {
        let config = Config::from_properties(props)?;
        StoreAdapter::connect(config).await
    }

    pub async fn connect(config: Config) -> Result<StoreAdapter> {
        let addr = config.addr();
        let connection = match Connection::connect(&addr, config.timeout).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(addr, error = %e, "Unable to connect to store");
                return Err(e);
            }
        };
        info!(
            addr,
            space = config.space,
            version = %connection.greeting().version,
            "Store adapter initialised"
        );
        Ok(StoreAdapter {
            config,
            connection: Mutex::new(Some(connection)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Close the connection. Later calls, and calls on an adapter whose
    /// connection is already gone, do nothing.
    pub async fn cleanup(&self) -> Result<()> {
        match self.connection.lock().await.take() {
            Some(connection) => connection.close().await,
            None => {
                debug!("Cleanup without an open connection");
                Ok(())
            }
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.connection().await?.ping().await
    }

    /// Insert a new record. Fails if the key already exists.
    pub async fn insert_record(&self, table: &str, key: &str, record: &Record) -> Result<()> {
        let space = self.config.space_for(table);
        debug!(table, key, space, fields = record.len(), "Inserting record");
        self.connection()
            .await?
            .insert(space, to_tuple(key, record))
            .await?;
        Ok(())
    }

    /// Overwrite the record stored at `key`, creating it if absent. Fields
    /// missing from `record` do not survive.
    pub async fn update_record(&self, table: &str, key: &str, record: &Record) -> Result<()> {
        let space = self.config.space_for(table);
        debug!(table, key, space, fields = record.len(), "Replacing record");
        self.connection()
            .await?
            .replace(space, to_tuple(key, record))
            .await?;
        Ok(())
    }

    /// Look up a single record, keeping only `fields` when given.
    pub async fn read_record(
        &self,
        table: &str,
        key: &str,
        fields: Option<&HashSet<String>>,
    ) -> Result<Option<Record>> {
        let space = self.config.space_for(table);
        let tuples = self
            .connection()
            .await?
            .select(space, vec![Value::from(key)], 0, 1, IteratorType::Eq)
            .await?;
        match tuples.first() {
            Some(tuple) => from_tuple(tuple, fields).map(|(_, record)| Some(record)),
            None => {
                debug!(table, key, "Record not found");
                Ok(None)
            }
        }
    }

    pub async fn delete_record(&self, table: &str, key: &str) -> Result<()> {
        let space = self.config.space_for(table);
        self.connection()
            .await?
            .delete(space, vec![Value::from(key)])
            .await?;
        Ok(())
    }

    /// Start a scan over at most `count` records whose keys are at or after
    /// `start_key`.
    pub fn cursor<'a>(
        &'a self,
        table: &str,
        start_key: &str,
        count: usize,
        fields: Option<&'a HashSet<String>>,
    ) -> ScanCursor<'a> {
        ScanCursor {
            adapter: self,
            space: self.config.space_for(table),
            fields,
            next_key: start_key.to_string(),
            iterator: IteratorType::Ge,
            remaining: count,
            buffered: VecDeque::new(),
            exhausted: count == 0,
        }
    }

    /// Collect a whole scan, keyed rows in store order.
    pub async fn scan_records(
        &self,
        table: &str,
        start_key: &str,
        count: usize,
        fields: Option<&HashSet<String>>,
    ) -> Result<Vec<(String, Record)>> {
        let mut cursor = self.cursor(table, start_key, count, fields);
        let mut rows = Vec::with_capacity(count.min(self.config.scan_batch as usize));
        while let Some(row) = cursor.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn connection(&self) -> Result<MappedMutexGuard<'_, Connection>> {
        MutexGuard::try_map(self.connection.lock().await, Option::as_mut)
            .map_err(|_| Error::NotConnected)
    }
}

/// Lazily pages through a key range.
///
/// Records are fetched in batches of at most `scan_batch` tuples: the first
/// batch starts at the start key inclusively, each later one strictly after
/// the last key seen. A cursor yields at most the requested number of records
/// and cannot be rewound.
pub struct ScanCursor<'a> {
    adapter: &'a StoreAdapter,
    space: u32,
    fields: Option<&'a HashSet<String>>,
    next_key: String,
    iterator: IteratorType,
    remaining: usize,
    buffered: VecDeque<(String, Record)>,
    exhausted: bool,
}

impl<'a> ScanCursor<'a> {
    pub async fn next_row(&mut self) -> Result<Option<(String, Record)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.buffered.is_empty() && !self.exhausted {
            self.fetch().await?;
        }
        match self.buffered.pop_front() {
            Some(row) => {
                self.remaining -= 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    async fn fetch(&mut self) -> Result<()> {
        let limit = self
            .remaining
            .min(self.adapter.config.scan_batch as usize);
        let tuples = self
            .adapter
            .connection()
            .await?
            .select(
                self.space,
                vec![Value::from(self.next_key.as_str())],
                0,
                limit as u32,
                self.iterator,
            )
            .await?;
        debug!(
            space = self.space,
            start = %self.next_key,
            limit,
            fetched = tuples.len(),
            "Fetched scan batch"
        );
        if tuples.len() < limit {
            self.exhausted = true;
        }
        for tuple in &tuples {
            let row = from_tuple(tuple, self.fields)?;
            self.next_key.clone_from(&row.0);
            self.buffered.push_back(row);
        }
        self.iterator = IteratorType::Gt;
        Ok(())
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = Result<(String, Record)>> + 'a {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok::<_, Error>(cursor.next_row().await?.map(|row| (row, cursor)))
        })
    }
}
