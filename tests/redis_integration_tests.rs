//! Integration Tests against a live Redis server
//!
//! Each test starts its own Redis container through testcontainers, so the
//! scripted journal runs against a real server in the default suite.

use std::sync::Arc;
use std::time::Duration;

use redis_cache::cache::{current_timestamp_micros, Dependencies};
use redis_cache::client::ConnectOptions;
use redis_cache::journal::LUA_REQUIRED_VERSION;
use redis_cache::{
    CacheStore, CleanConditions, Journal, JournalEntry, KvClient, LeaseLock, LockOptions,
    LuaJournal, RedisClient, ShardAddr, TransactionalJournal,
};
use testcontainers::runners::SyncRunner;
use testcontainers::Container;
use testcontainers_modules::redis::Redis;

// == Helper Functions ==

/// Running server; the container stops when the value is dropped.
struct Server {
    _container: Container<Redis>,
    client: Arc<RedisClient>,
}

fn server() -> Server {
    let container = Redis::default().start().expect("start redis container");
    let port = container.get_host_port_ipv4(6379).expect("get port");
    let addr = ShardAddr::new("127.0.0.1", port);
    Server {
        _container: container,
        client: Arc::new(RedisClient::new(addr, ConnectOptions::default())),
    }
}

fn namespace(name: &str) -> String {
    format!("Test.{}.{}", name, current_timestamp_micros())
}

fn sorted(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys
}

fn journal_scenario(journal: &dyn Journal) {
    journal
        .write("a:1", &JournalEntry::new(vec!["T".into(), "shared".into()], Some(1)))
        .unwrap();
    journal
        .write("b\0x", &JournalEntry::new(vec!["T".into()], Some(5)))
        .unwrap();
    journal
        .write("c", &JournalEntry::new(vec!["U".into(), "shared".into()], Some(10)))
        .unwrap();

    let removed = journal.clean(&CleanConditions::tags(["T"])).unwrap();
    assert_eq!(sorted(removed.keys().to_vec()), vec!["a:1", "b\0x"]);

    let removed = journal.clean(&CleanConditions::tags(["shared"])).unwrap();
    assert_eq!(removed.keys(), &["c".to_string()]);

    journal
        .write("d", &JournalEntry::new(vec![], Some(3)))
        .unwrap();
    let removed = journal.clean(&CleanConditions::priority(5)).unwrap();
    assert_eq!(removed.keys(), &["d".to_string()]);
}

// == Client ==

#[test]
fn test_server_supports_scripts() {
    let server = server();
    let client = server.client.clone();
    assert!(!client.server_version().unwrap().is_empty());
    client.assert_version(LUA_REQUIRED_VERSION).unwrap();
}

// == Journals ==

#[test]
fn test_lua_journal_on_redis() {
    let server = server();
    let client = server.client.clone();
    let ns = namespace("Lua");
    let journal = LuaJournal::with_namespace(client.clone(), ns.clone());

    journal_scenario(&journal);
    journal.clean(&CleanConditions::all()).unwrap();
    assert!(client.keys(&format!("{}:*", ns)).unwrap().is_empty());
}

#[test]
fn test_transactional_journal_on_redis() {
    let server = server();
    let client = server.client.clone();
    let ns = namespace("Multi");
    let journal = TransactionalJournal::with_namespace(client.clone(), ns.clone());

    journal_scenario(&journal);
    journal.clean(&CleanConditions::all()).unwrap();
    assert!(client.keys(&format!("{}:*", ns)).unwrap().is_empty());
}

#[test]
fn test_journals_share_layout() {
    let server = server();
    let client = server.client.clone();
    let ns = namespace("Shared");
    let lua = LuaJournal::with_namespace(client.clone(), ns.clone());
    let multi = TransactionalJournal::with_namespace(client.clone(), ns.clone());

    lua.write("k", &JournalEntry::new(vec!["t".into()], None)).unwrap();
    let removed = multi.clean(&CleanConditions::tags(["t"])).unwrap();
    assert_eq!(removed.keys(), &["k".to_string()]);
    assert!(client.keys(&format!("{}:*", ns)).unwrap().is_empty());
}

// == Lock ==

#[test]
fn test_lease_lock_on_redis() {
    let server = server();
    let client = server.client.clone();
    let resource = namespace("Lock");
    let lease = |duration_ms: u64| LockOptions {
        duration: Duration::from_millis(duration_ms),
        ..LockOptions::default()
    };
    let mut holder = LeaseLock::new(client.clone(), lease(5_000));
    let mut waiter = LeaseLock::new(client.clone(), lease(300));

    assert!(holder.acquire(&resource).unwrap());
    assert!(waiter.acquire(&resource).is_err());
    assert!(holder.renew(&resource).unwrap());
    assert!(holder.release(&resource).unwrap());
    assert!(waiter.acquire(&resource).unwrap());
    waiter.release_all().unwrap();
}

// == Store ==

#[test]
fn test_store_scenario_on_redis() {
    let server = server();
    let client = server.client.clone();
    let journal: Arc<dyn Journal> = Arc::new(LuaJournal::with_namespace(
        client.clone(),
        namespace("StoreJournal"),
    ));
    let mut store = CacheStore::new(client.clone(), Some(journal))
        .with_namespace(namespace("Store"));

    store
        .write("u:1", b"v1", &Dependencies::new().tags(["users"]))
        .unwrap();
    assert_eq!(store.read("u:1").unwrap(), Some(b"v1".to_vec()));

    store.clean(&CleanConditions::tags(["users"])).unwrap();
    assert_eq!(store.read("u:1").unwrap(), None);

    store
        .write("bulk", b"x", &Dependencies::new().expire(Duration::from_secs(30)))
        .unwrap();
    let values = store.multi_read(&["bulk", "missing"]).unwrap();
    assert_eq!(values["bulk"], Some(b"x".to_vec()));
    assert_eq!(values["missing"], None);

    store.clean(&CleanConditions::all()).unwrap();
    assert_eq!(store.read("bulk").unwrap(), None);
}
