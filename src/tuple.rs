use rmpv::Value;
use std::collections::{BTreeMap, HashSet};

use crate::{Error, Result};

/// A record is a set of named fields. Its primary key is kept outside of the map.
///
/// Fields are ordered by name, which makes the tuple built from a record
/// deterministic.
pub type Record = BTreeMap<String, String>;

/// Build the wire tuple for a record: the key followed by alternating field
/// names and values.
pub fn to_tuple(key: &str, record: &Record) -> Vec<Value> {
    let mut tuple = Vec::with_capacity(1 + 2 * record.len());
    tuple.push(Value::from(key));
    for (field, value) in record {
        tuple.push(Value::from(field.as_str()));
        tuple.push(Value::from(value.as_str()));
    }
    tuple
}

/// Convert a tuple returned by the store back into its key and record, keeping
/// only the fields named in `fields` when a set is given.
///
/// Every name and value must be a string, whether or not its field is kept.
/// Binary values are rejected as malformed.
pub fn from_tuple(tuple: &Value, fields: Option<&HashSet<String>>) -> Result<(String, Record)> {
    let items = tuple
        .as_array()
        .ok_or_else(|| Error::MalformedTuple(format!("expected an array, got {tuple}")))?;
    let (key, pairs) = items
        .split_first()
        .ok_or_else(|| Error::MalformedTuple("empty tuple".to_string()))?;
    if pairs.len() % 2 != 0 {
        return Err(Error::MalformedTuple(format!(
            "tuple of length {} has a field without a value",
            items.len()
        )));
    }

    let key = as_string(key, 0)?;
    let mut record = Record::new();
    for (i, pair) in pairs.chunks_exact(2).enumerate() {
        let field = as_string(&pair[0], 2 * i + 1)?;
        let value = as_string(&pair[1], 2 * i + 2)?;
        if fields.map_or(true, |wanted| wanted.contains(&field)) {
            record.insert(field, value);
        }
    }
    Ok((key, record))
}

fn as_string(value: &Value, position: usize) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::MalformedTuple(format!("field {position} is not a string: {value}")))
}
