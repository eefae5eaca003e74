use std::collections::HashSet;
use tokio::runtime::{Builder, Runtime};

use crate::adapter::StoreAdapter;
use crate::config::Properties;
use crate::db::{Db, Status};
use crate::tuple::Record;
use crate::Result;

/// Synchronous front for [`StoreAdapter`]. Every call blocks the calling
/// thread until the store answers.
///
/// The adapter runs on a private single threaded runtime, so this type must
/// not be used from within another tokio runtime.
pub struct BlockingAdapter {
    runtime: Runtime,
    adapter: StoreAdapter,
}

impl BlockingAdapter {
    pub fn init(props: &Properties) -> Result<BlockingAdapter> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let adapter = runtime.block_on(StoreAdapter::init(props))?;
        Ok(BlockingAdapter { runtime, adapter })
    }

    pub fn adapter(&self) -> &StoreAdapter {
        &self.adapter
    }

    pub fn ping(&self) -> Status {
        Status::from(&self.runtime.block_on(self.adapter.ping()))
    }

    pub fn cleanup(&self) -> Status {
        self.runtime.block_on(Db::cleanup(&self.adapter))
    }

    pub fn insert(&self, table: &str, key: &str, values: &Record) -> Status {
        self.runtime.block_on(self.adapter.insert(table, key, values))
    }

    pub fn read(
        &self,
        table: &str,
        key: &str,
        fields: Option<&HashSet<String>>,
        result: &mut Record,
    ) -> Status {
        self.runtime
            .block_on(self.adapter.read(table, key, fields, result))
    }

    pub fn update(&self, table: &str, key: &str, values: &Record) -> Status {
        self.runtime.block_on(self.adapter.update(table, key, values))
    }

    pub fn delete(&self, table: &str, key: &str) -> Status {
        self.runtime.block_on(self.adapter.delete(table, key))
    }

    pub fn scan(
        &self,
        table: &str,
        start_key: &str,
        record_count: usize,
        fields: Option<&HashSet<String>>,
        result: &mut Vec<Record>,
    ) -> Status {
        self.runtime.block_on(
            self.adapter
                .scan(table, start_key, record_count, fields, result),
        )
    }
}
