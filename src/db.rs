use std::collections::HashSet;
use std::future::Future;
use tracing::error;

use crate::adapter::StoreAdapter;
use crate::config::Properties;
use crate::tuple::Record;
use crate::Result;

/// Outcome of a harness operation. Harness tooling branches on the integer
/// value, so the discriminants are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
#[must_use]
pub enum Status {
    Ok = 0,
    Error = 1,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(_) => Status::Error,
        }
    }
}

/// The interface a benchmark harness drives. Every operation reports a flat
/// [`Status`]; results are written into caller owned containers, which are
/// cleared first and left empty on failure.
pub trait Db: Sized + Send + Sync + 'static {
    fn init(props: &Properties) -> impl Future<Output = Result<Self>> + Send;
    fn cleanup(&self) -> impl Future<Output = Status> + Send;

    fn insert(&self, table: &str, key: &str, values: &Record)
        -> impl Future<Output = Status> + Send;

    fn read(
        &self,
        table: &str,
        key: &str,
        fields: Option<&HashSet<String>>,
        result: &mut Record,
    ) -> impl Future<Output = Status> + Send;

    fn update(&self, table: &str, key: &str, values: &Record)
        -> impl Future<Output = Status> + Send;

    fn delete(&self, table: &str, key: &str) -> impl Future<Output = Status> + Send;

    fn scan(
        &self,
        table: &str,
        start_key: &str,
        record_count: usize,
        fields: Option<&HashSet<String>>,
        result: &mut Vec<Record>,
    ) -> impl Future<Output = Status> + Send;
}

/// Log a failed operation and flatten it to a status.
fn report<T>(op: &'static str, key: &str, result: Result<T>) -> std::result::Result<T, Status> {
    result.map_err(|e| {
        error!(
            op,
            key,
            communication = e.is_communication(),
            error = %e,
            "Operation failed"
        );
        Status::Error
    })
}

impl Db for StoreAdapter {
    async fn init(props: &Properties) -> Result<Self> {
        StoreAdapter::init(props).await
    }

    async fn cleanup(&self) -> Status {
        match report("cleanup", "", StoreAdapter::cleanup(self).await) {
            Ok(()) => Status::Ok,
            Err(status) => status,
        }
    }

    async fn insert(&self, table: &str, key: &str, values: &Record) -> Status {
        match report("insert", key, self.insert_record(table, key, values).await) {
            Ok(()) => Status::Ok,
            Err(status) => status,
        }
    }

    async fn read(
        &self,
        table: &str,
        key: &str,
        fields: Option<&HashSet<String>>,
        result: &mut Record,
    ) -> Status {
        result.clear();
        match report("read", key, self.read_record(table, key, fields).await) {
            Ok(found) => {
                result.extend(found.unwrap_or_default());
                Status::Ok
            }
            Err(status) => status,
        }
    }

    async fn update(&self, table: &str, key: &str, values: &Record) -> Status {
        match report("update", key, self.update_record(table, key, values).await) {
            Ok(()) => Status::Ok,
            Err(status) => status,
        }
    }

    async fn delete(&self, table: &str, key: &str) -> Status {
        match report("delete", key, self.delete_record(table, key).await) {
            Ok(()) => Status::Ok,
            Err(status) => status,
        }
    }

    async fn scan(
        &self,
        table: &str,
        start_key: &str,
        record_count: usize,
        fields: Option<&HashSet<String>>,
        result: &mut Vec<Record>,
    ) -> Status {
        result.clear();
        let rows = self
            .scan_records(table, start_key, record_count, fields)
            .await;
        match report("scan", start_key, rows) {
            Ok(rows) => {
                result.extend(rows.into_iter().map(|(_, record)| record));
                Status::Ok
            }
            Err(status) => status,
        }
    }
}
