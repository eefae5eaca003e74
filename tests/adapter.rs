use futures::TryStreamExt;
use rmpv::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tntbench::proto::{read_frame, Frame, Greeting, IteratorType, Response, GREETING_SIZE};
use tntbench::tuple::to_tuple;
use tntbench::{Db, Error, Properties, Record, Status, StoreAdapter, TupleServer, TupleStore};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

const TABLE: &str = "usertable";

async fn start_server() -> (Properties, TupleStore) {
    let store = TupleStore::with_spaces([1024, 2048]);
    let server = TupleServer::bind(store.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .expect("unable to bind tuple server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut props = Properties::new();
    props.set("tarantool.host", "127.0.0.1");
    props.set("tarantool.port", addr.port().to_string());
    (props, store)
}

fn record(fields: &[(&str, &str)]) -> Record {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn fields(names: &[&str]) -> HashSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// Insert, filtered and unfiltered reads, then delete of a single record
#[tokio::test]
async fn insert_read_delete() {
    let (props, _) = start_server().await;
    let adapter = StoreAdapter::init(&props).await.unwrap();
    let user = record(&[("name", "a"), ("age", "30")]);

    assert_eq!(adapter.insert(TABLE, "u1", &user).await, Status::Ok);

    let mut result = Record::new();
    assert_eq!(adapter.read(TABLE, "u1", None, &mut result).await, Status::Ok);
    assert_eq!(result, user);

    let wanted = fields(&["name"]);
    assert_eq!(
        adapter.read(TABLE, "u1", Some(&wanted), &mut result).await,
        Status::Ok
    );
    assert_eq!(result, record(&[("name", "a")]));

    assert_eq!(adapter.delete(TABLE, "u1").await, Status::Ok);
    assert_eq!(adapter.read(TABLE, "u1", None, &mut result).await, Status::Ok);
    assert!(result.is_empty());

    assert_eq!(Db::cleanup(&adapter).await, Status::Ok);
}

#[tokio::test]
async fn insert_stores_key_then_field_pairs() {
    let (props, store) = start_server().await;
    let adapter = StoreAdapter::init(&props).await.unwrap();
    let user = record(&[("name", "a"), ("age", "30"), ("city", "b")]);
    adapter.insert_record(TABLE, "u1", &user).await.unwrap();

    let stored = store
        .select(1024, 0, &["u1".into()], IteratorType::Eq, 1, 0)
        .unwrap();
    let tuple = &stored[0];
    assert_eq!(tuple.len(), 1 + 2 * user.len());
    assert_eq!(tuple[0], Value::from("u1"));
    assert_eq!(tuple[1], Value::from("age"));
    assert_eq!(tuple[2], Value::from("30"));
}

// Replace semantics: fields missing from the new record are gone
#[tokio::test]
async fn update_overwrites_every_field() {
    let (props, _) = start_server().await;
    let adapter = StoreAdapter::init(&props).await.unwrap();
    adapter
        .insert_record(TABLE, "u1", &record(&[("name", "a"), ("age", "30")]))
        .await
        .unwrap();

    let replacement = record(&[("name", "b")]);
    assert_eq!(adapter.update(TABLE, "u1", &replacement).await, Status::Ok);
    assert_eq!(
        adapter.read_record(TABLE, "u1", None).await.unwrap(),
        Some(replacement)
    );

    // update of an absent key creates it
    assert_eq!(adapter.update(TABLE, "u2", &record(&[("x", "1")])).await, Status::Ok);
    assert!(adapter.read_record(TABLE, "u2", None).await.unwrap().is_some());
}

#[tokio::test]
async fn duplicate_insert_fails_without_changes() {
    let (props, _) = start_server().await;
    let adapter = StoreAdapter::init(&props).await.unwrap();
    let original = record(&[("name", "a")]);
    adapter.insert_record(TABLE, "u1", &original).await.unwrap();

    assert_eq!(
        adapter.insert(TABLE, "u1", &record(&[("name", "b")])).await,
        Status::Error
    );
    match adapter.insert_record(TABLE, "u1", &original).await {
        Err(Error::Store { code, .. }) => assert_eq!(code, 3),
        other => panic!("expected duplicate key error, got {other:?}"),
    }
    assert_eq!(
        adapter.read_record(TABLE, "u1", None).await.unwrap(),
        Some(original)
    );
}

#[tokio::test]
async fn scan_pages_through_keys_in_order() {
    let (mut props, _) = start_server().await;
    props.set("tarantool.scan_batch", "3");
    let adapter = StoreAdapter::init(&props).await.unwrap();
    for i in 0..10 {
        adapter
            .insert_record(TABLE, &format!("user{i:02}"), &record(&[("n", i.to_string().as_str())]))
            .await
            .unwrap();
    }

    let rows = adapter.scan_records(TABLE, "user03", 5, None).await.unwrap();
    let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, ["user03", "user04", "user05", "user06", "user07"]);
    assert_eq!(rows[0].1, record(&[("n", "3")]));

    // start key between stored keys, and a range shorter than the count
    let rows = adapter.scan_records(TABLE, "user075", 50, None).await.unwrap();
    let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, ["user08", "user09"]);

    let mut result = vec![record(&[("stale", "x")])];
    assert_eq!(adapter.scan(TABLE, "user00", 0, None, &mut result).await, Status::Ok);
    assert!(result.is_empty());

    let wanted = fields(&["missing"]);
    assert_eq!(
        adapter.scan(TABLE, "user00", 4, Some(&wanted), &mut result).await,
        Status::Ok
    );
    assert_eq!(result.len(), 4);
    assert!(result.iter().all(Record::is_empty));
}

#[tokio::test]
async fn cursor_streams_rows() {
    let (mut props, _) = start_server().await;
    props.set("tarantool.scan_batch", "2");
    let adapter = StoreAdapter::init(&props).await.unwrap();
    for key in ["a", "b", "c", "d", "e"] {
        adapter
            .insert_record(TABLE, key, &record(&[("v", key)]))
            .await
            .unwrap();
    }

    let rows: Vec<(String, Record)> = adapter
        .cursor(TABLE, "b", 3, None)
        .into_stream()
        .try_collect()
        .await
        .unwrap();
    let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, ["b", "c", "d"]);

    let mut cursor = adapter.cursor(TABLE, "e", 10, None);
    assert_eq!(cursor.next_row().await.unwrap().unwrap().0, "e");
    assert!(cursor.next_row().await.unwrap().is_none());
    assert!(cursor.next_row().await.unwrap().is_none());
}

#[tokio::test]
async fn malformed_tuples_fail_reads_and_scans() {
    let (props, store) = start_server().await;
    let adapter = StoreAdapter::init(&props).await.unwrap();
    store
        .replace(1024, vec!["bad".into(), "dangling".into()])
        .unwrap();

    let mut result = Record::new();
    assert_eq!(adapter.read(TABLE, "bad", None, &mut result).await, Status::Error);
    assert!(matches!(
        adapter.read_record(TABLE, "bad", None).await,
        Err(Error::MalformedTuple(_))
    ));

    let mut rows = Vec::new();
    assert_eq!(adapter.scan(TABLE, "a", 10, None, &mut rows).await, Status::Error);
    assert!(rows.is_empty());
}

#[tokio::test]
async fn tables_map_to_configured_spaces() {
    let (mut props, store) = start_server().await;
    props.set("tarantool.table.accounts", "2048");
    props.set("tarantool.table.missing", "4096");
    let adapter = StoreAdapter::init(&props).await.unwrap();

    assert_eq!(adapter.insert("accounts", "k", &record(&[("a", "1")])).await, Status::Ok);
    assert_eq!(adapter.insert(TABLE, "k", &record(&[("a", "1")])).await, Status::Ok);
    assert_eq!(store.space_len(2048), Some(1));
    assert_eq!(store.space_len(1024), Some(1));

    let mut result = Record::new();
    assert_eq!(adapter.read("missing", "k", None, &mut result).await, Status::Error);
    assert_eq!(adapter.delete("missing", "k").await, Status::Error);
}

#[tokio::test]
async fn cleanup_is_idempotent_and_disconnects() {
    let (props, _) = start_server().await;
    let adapter = StoreAdapter::init(&props).await.unwrap();
    adapter.ping().await.unwrap();

    assert_eq!(Db::cleanup(&adapter).await, Status::Ok);
    assert_eq!(Db::cleanup(&adapter).await, Status::Ok);

    assert!(matches!(adapter.ping().await, Err(Error::NotConnected)));
    assert_eq!(adapter.delete(TABLE, "u1").await, Status::Error);
}

#[tokio::test]
async fn init_reports_connection_failures() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut props = Properties::new();
    props.set("tarantool.host", "127.0.0.1");
    props.set("tarantool.port", port.to_string());
    assert!(matches!(
        StoreAdapter::init(&props).await,
        Err(Error::Connect { .. })
    ));

    props.set("tarantool.port", "abc");
    assert!(matches!(
        StoreAdapter::init(&props).await,
        Err(Error::InvalidProperty { .. })
    ));
}

// A store that greets and then never answers
#[tokio::test]
async fn requests_time_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let greeting = Greeting {
            version: "1.6.8".to_string(),
            salt: "x".repeat(44),
        }
        .encode("silent");
        assert_eq!(greeting.len(), GREETING_SIZE);
        stream.write_all(&greeting).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let mut props = Properties::new();
    props.set("tarantool.host", "127.0.0.1");
    props.set("tarantool.port", port.to_string());
    props.set("tarantool.timeout_ms", "100");
    let adapter = StoreAdapter::init(&props).await.unwrap();

    let err = adapter.read_record(TABLE, "u1", None).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(err.is_communication());

    let mut result = Record::new();
    assert_eq!(adapter.read(TABLE, "u1", None, &mut result).await, Status::Error);
}

fn greeting(instance: &str) -> Vec<u8> {
    Greeting {
        version: "1.6.8".to_string(),
        salt: "x".repeat(44),
    }
    .encode(instance)
}

// The reply to the first request stalls after its first bytes, past the
// client timeout. Later replies are immediate.
#[tokio::test]
async fn reply_split_by_timeout_is_skipped_later() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&greeting("stalling")).await.unwrap();

        let user = record(&[("name", "a")]);
        while let Some(payload) = read_frame(&mut stream).await.unwrap() {
            let sync = Frame::decode(&payload).unwrap().sync;
            let reply = Response::Data(vec![Value::Array(to_tuple("u1", &user))])
                .encode(sync)
                .unwrap();
            if sync == 1 {
                stream.write_all(&reply[..3]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(300)).await;
                stream.write_all(&reply[3..]).await.unwrap();
            } else {
                stream.write_all(&reply).await.unwrap();
            }
        }
    });

    let mut props = Properties::new();
    props.set("tarantool.host", "127.0.0.1");
    props.set("tarantool.port", port.to_string());
    props.set("tarantool.timeout_ms", "100");
    let adapter = StoreAdapter::init(&props).await.unwrap();

    assert!(matches!(
        adapter.read_record(TABLE, "u1", None).await,
        Err(Error::Timeout(_))
    ));
    tokio::time::sleep(Duration::from_millis(400)).await;

    for _ in 0..3 {
        assert_eq!(
            adapter.read_record(TABLE, "u1", None).await.unwrap(),
            Some(record(&[("name", "a")]))
        );
    }
    let mut result = Record::new();
    assert_eq!(adapter.read(TABLE, "u1", None, &mut result).await, Status::Ok);
}

// Once the store hangs up, later requests fail without touching the socket
#[tokio::test]
async fn closed_connection_stays_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&greeting("closing")).await.unwrap();
        read_frame(&mut stream).await.unwrap();
    });

    let mut props = Properties::new();
    props.set("tarantool.host", "127.0.0.1");
    props.set("tarantool.port", port.to_string());
    let adapter = StoreAdapter::init(&props).await.unwrap();

    let err = adapter.ping().await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(matches!(adapter.ping().await, Err(Error::Broken)));
    assert_eq!(adapter.delete(TABLE, "u1").await, Status::Error);
}

#[tokio::test]
async fn shared_adapter_serves_concurrent_tasks() {
    let (props, _) = start_server().await;
    let adapter = Arc::new(StoreAdapter::init(&props).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..50 {
        let adapter = adapter.clone();
        handles.push(tokio::spawn(async move {
            let key = format!("key{i}");
            let values = record(&[("value", format!("value{i}").as_str())]);
            assert_eq!(adapter.insert(TABLE, &key, &values).await, Status::Ok);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for i in 0..50 {
        let mut result = Record::new();
        assert_eq!(
            adapter.read(TABLE, &format!("key{i}"), None, &mut result).await,
            Status::Ok
        );
        assert_eq!(result, record(&[("value", format!("value{i}").as_str())]));
    }
}
