use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub const PROPERTY_PREFIX: &str = "tarantool.";
pub const HOST_PROPERTY: &str = "tarantool.host";
pub const PORT_PROPERTY: &str = "tarantool.port";
pub const SPACE_PROPERTY: &str = "tarantool.space";
pub const TABLE_PROPERTY_PREFIX: &str = "tarantool.table.";
pub const TIMEOUT_PROPERTY: &str = "tarantool.timeout_ms";
pub const SCAN_BATCH_PROPERTY: &str = "tarantool.scan_batch";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 3301;
pub const DEFAULT_SPACE: u32 = 1024;
pub const DEFAULT_SCAN_BATCH: u32 = 100;

/// String keyed settings handed to a binding by the benchmark harness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(HashMap<String, String>);

impl Properties {
    pub fn new() -> Properties {
        Properties::default()
    }

    /// Load a properties file of `key=value` (or `key: value`) lines. Blank
    /// lines and lines starting with `#` or `!` are ignored.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Properties> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::PropertiesFile {
            source,
            filename: path.display().to_string(),
        })?;
        let mut props = Properties::new();
        props.merge_str(&contents)?;
        Ok(props)
    }

    pub fn merge_str(&mut self, contents: &str) -> Result<()> {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            self.set_pair(line)?;
        }
        Ok(())
    }

    /// Apply a single `key=value` override, as given with `-p` on the command line.
    pub fn set_pair(&mut self, pair: &str) -> Result<()> {
        let (key, value) = pair
            .split_once(|c: char| c == '=' || c == ':')
            .ok_or_else(|| Error::InvalidProperty {
                key: pair.to_string(),
                value: String::new(),
                reason: "expected key=value".to_string(),
            })?;
        self.set(key.trim(), value.trim());
        Ok(())
    }

    /// Copy every property of `other` over this one.
    pub fn merge(&mut self, other: Properties) {
        self.0.extend(other.0);
    }

    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Look up a `tarantool.` property, falling back to its bare name.
    fn lookup<'a>(&'a self, key: &'a str) -> Option<(&'a str, &'a str)> {
        self.get(key).map(|v| (key, v)).or_else(|| {
            let bare = key.strip_prefix(PROPERTY_PREFIX)?;
            self.get(bare).map(|v| (bare, v))
        })
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.lookup(key) {
            Some((name, raw)) => raw
                .parse()
                .map(Some)
                .map_err(|e: T::Err| Error::InvalidProperty {
                    key: name.to_string(),
                    value: raw.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Properties(iter.into_iter().collect())
    }
}

/// Typed adapter settings, resolved once from [`Properties`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Space used by every table without an explicit mapping.
    pub space: u32,

    /// Logical table name to space id.
    pub tables: HashMap<String, u32>,

    /// Applied to every request on the connection. No timeout when unset.
    pub timeout: Option<Duration>,

    /// Upper bound on tuples fetched per round trip while scanning.
    pub scan_batch: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            space: DEFAULT_SPACE,
            tables: HashMap::new(),
            timeout: None,
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }
}

impl Config {
    pub fn from_properties(props: &Properties) -> Result<Config> {
        let defaults = Config::default();
        let host = props
            .lookup(HOST_PROPERTY)
            .map(|(_, host)| host.to_string())
            .unwrap_or(defaults.host);

        let mut tables = HashMap::new();
        for (key, raw) in props.iter() {
            if let Some(table) = key.strip_prefix(TABLE_PROPERTY_PREFIX) {
                let space = raw.parse().map_err(|e: std::num::ParseIntError| {
                    Error::InvalidProperty {
                        key: key.to_string(),
                        value: raw.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                tables.insert(table.to_string(), space);
            }
        }

        let scan_batch = props
            .parse(SCAN_BATCH_PROPERTY)?
            .unwrap_or(defaults.scan_batch);
        if scan_batch == 0 {
            return Err(Error::InvalidProperty {
                key: SCAN_BATCH_PROPERTY.to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Config {
            host,
            port: props.parse(PORT_PROPERTY)?.unwrap_or(defaults.port),
            space: props.parse(SPACE_PROPERTY)?.unwrap_or(defaults.space),
            tables,
            timeout: props
                .parse::<u64>(TIMEOUT_PROPERTY)?
                .map(Duration::from_millis),
            scan_batch,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The space holding records of `table`.
    pub fn space_for(&self, table: &str) -> u32 {
        self.tables.get(table).copied().unwrap_or(self.space)
    }
}
