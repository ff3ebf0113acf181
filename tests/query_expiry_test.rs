// TTL expiry of stored queries

use std::time::Duration;

use metricflowd::{QueryStatus, QueryStore, StoredQuery};
use pretty_assertions::assert_eq;

#[test]
fn stored_query_expires_after_ttl() {
    let store = QueryStore::new(Duration::from_secs(1));
    store.set(StoredQuery::new("q1", "p1", QueryStatus::Successful));

    let (stored, expired) = store.get("q1");
    assert!(stored.is_some());
    assert!(!expired);

    std::thread::sleep(Duration::from_secs(2));

    // first read after the deadline reports the expiry and evicts
    assert_eq!(store.get("q1"), (None, true));
    // the record is gone, so the next read is a plain miss
    assert_eq!(store.get("q1"), (None, false));
}
