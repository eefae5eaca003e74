use clap::Subcommand;
use std::collections::HashSet;
use std::io::Write;

use crate::{BlockingAdapter, Record, Status};

/// Operations that can be run against the store from the command line.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Action {
    /// Insert a new record. Fails if the key already exists.
    Insert {
        key: String,

        /// Fields given as name=value.
        #[arg(value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Read one record and print it as JSON.
    Read {
        key: String,

        /// Only print these fields. All fields are printed when omitted.
        #[arg(short, long = "field")]
        fields: Vec<String>,
    },

    /// Replace the record stored under the key with the given fields.
    Update {
        key: String,

        #[arg(value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },

    /// Remove the record stored under the key.
    #[clap(alias = "rm")]
    Delete { key: String },

    /// Print up to `count` records starting at `start_key`, one JSON object per line.
    Scan {
        start_key: String,
        count: usize,

        #[arg(short, long = "field")]
        fields: Vec<String>,
    },

    /// Check that the store answers requests.
    Ping,

    /// Print the resolved adapter settings as JSON.
    Config,
}

pub fn parse_field(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{s}'"))
}

fn field_set(fields: Vec<String>) -> Option<HashSet<String>> {
    if fields.is_empty() {
        None
    } else {
        Some(fields.into_iter().collect())
    }
}

impl Action {
    /// Run the action and write any records it returns to `out`.
    pub fn execute<W: Write>(
        self,
        adapter: &BlockingAdapter,
        table: &str,
        out: &mut W,
    ) -> anyhow::Result<Status> {
        let status = match self {
            Action::Insert { key, fields } => {
                adapter.insert(table, &key, &fields.into_iter().collect())
            }
            Action::Update { key, fields } => {
                adapter.update(table, &key, &fields.into_iter().collect())
            }
            Action::Delete { key } => adapter.delete(table, &key),
            Action::Read { key, fields } => {
                let mut record = Record::new();
                let status = adapter.read(table, &key, field_set(fields).as_ref(), &mut record);
                if status.is_ok() {
                    writeln!(out, "{}", serde_json::to_string(&record)?)?;
                }
                status
            }
            Action::Scan {
                start_key,
                count,
                fields,
            } => {
                let mut records = Vec::new();
                let status = adapter.scan(
                    table,
                    &start_key,
                    count,
                    field_set(fields).as_ref(),
                    &mut records,
                );
                for record in &records {
                    writeln!(out, "{}", serde_json::to_string(record)?)?;
                }
                status
            }
            Action::Ping => adapter.ping(),
            Action::Config => {
                writeln!(out, "{}", serde_json::to_string(adapter.adapter().config())?)?;
                Status::Ok
            }
        };
        Ok(status)
    }
}
