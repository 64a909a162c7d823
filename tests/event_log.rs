//! End-to-end checks of the event log and the sync primitives, using
//! only the crate's public surface.
use anyhow::Result;
use quadrelay::event::Event;
use quadrelay::event_store::{EventStore, Outcome};
use quadrelay::negentropy::Negentropy;
use quadrelay::store::Store;

fn test_event(seq: u16, pubkey_byte: u8, kind: u16, created_at: i64) -> Event {
    let mut id = [0u8; 32];
    id[0] = (seq >> 8) as u8;
    id[1] = (seq & 0xff) as u8;
    Event {
        id: hex::encode(id),
        pubkey: hex::encode([pubkey_byte; 32]),
        created_at,
        kind,
        tags: vec![],
        content: "integration".into(),
        sig: hex::encode([0u8; 64]),
    }
}

fn populate(es: &EventStore, events: &[Event]) -> Result<u64> {
    let mut last_quad = 0;
    let mut txn = es.store().txn_rw()?;
    for e in events {
        es.install(&mut txn, e, 1_700_000_000, &mut last_quad)?;
    }
    txn.commit()?;
    Ok(last_quad)
}

#[test]
fn log_position_survives_reopen() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    {
        let es = EventStore::new(Store::open(dir.path(), 16)?);
        let events: Vec<Event> = (1..=3).map(|i| test_event(i, 1, 1, 1000 + i as i64)).collect();
        assert_eq!(populate(&es, &events)?, 3);
    }
    // a fresh process recovers its counter from the primary table
    let es = EventStore::new(Store::open(dir.path(), 16)?);
    let txn = es.store().txn_ro()?;
    assert_eq!(es.max_quad(&txn)?, 3);
    let (_, event) = es.get_by_quad(&txn, 2)?.expect("row for quad 2");
    assert_eq!(event.created_at, 1002);
    Ok(())
}

#[test]
fn deletion_flows_through_the_log() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let es = EventStore::new(Store::open(dir.path(), 16)?);
    let target = test_event(1, 9, 1, 1000);
    let mut deletion = test_event(2, 9, 5, 1001);
    deletion.tags = vec![vec!["e".into(), target.id.clone()]];

    let mut last_quad = populate(&es, &[target.clone()])?;
    let mut txn = es.store().txn_rw()?;
    let outcome = es.install(&mut txn, &deletion, 1_700_000_000, &mut last_quad)?;
    txn.commit()?;
    assert_eq!(outcome, Outcome::Stored(2));

    let txn = es.store().txn_ro()?;
    assert!(es
        .get_quad_by_id(&txn, &target.id_bytes()?)?
        .is_none());
    assert!(es
        .get_quad_by_id(&txn, &deletion.id_bytes()?)?
        .is_some());
    Ok(())
}

/// Two relays with overlapping stores discover exactly the events the
/// other is missing.
#[test]
fn stores_reconcile_their_difference() -> Result<()> {
    let dir_a = tempfile::TempDir::new()?;
    let dir_b = tempfile::TempDir::new()?;
    let relay_a = EventStore::new(Store::open(dir_a.path(), 16)?);
    let relay_b = EventStore::new(Store::open(dir_b.path(), 16)?);

    let shared: Vec<Event> = (0..500).map(|i| test_event(i, 1, 1, 1000 + i as i64)).collect();
    let only_a: Vec<Event> = (500..512).map(|i| test_event(i, 1, 1, 5000)).collect();
    let only_b: Vec<Event> = (512..530).map(|i| test_event(i, 1, 1, 6000)).collect();

    let mut a_events = shared.clone();
    a_events.extend_from_slice(&only_a);
    let mut b_events = shared;
    b_events.extend_from_slice(&only_b);
    let a_max = populate(&relay_a, &a_events)?;
    let b_max = populate(&relay_b, &b_events)?;

    // each side builds its sorted (created_at, id) view from its log
    let mut client = Negentropy::new(0);
    let txn = relay_a.store().txn_ro()?;
    for (_, event) in relay_a.scan_quad_range(&txn, 0, a_max)? {
        client.insert(event.created_at as u64, event.id_bytes()?)?;
    }
    client.seal()?;
    let mut server = Negentropy::new(0);
    let txn = relay_b.store().txn_ro()?;
    for (_, event) in relay_b.scan_quad_range(&txn, 0, b_max)? {
        server.insert(event.created_at as u64, event.id_bytes()?)?;
    }
    server.seal()?;

    let mut have = Vec::new();
    let mut need = Vec::new();
    let mut msg = client.initiate()?;
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 32, "reconciliation did not converge");
        let reply = server.reconcile(&msg)?;
        match client.reconcile_with_ids(&reply, &mut have, &mut need)? {
            Some(next) => msg = next,
            None => break,
        }
    }
    assert_eq!(have.len(), only_a.len());
    assert_eq!(need.len(), only_b.len());
    Ok(())
}
