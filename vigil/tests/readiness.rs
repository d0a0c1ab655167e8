mod common;

use common::{pair, raw, set_linger_zero, wait_for};

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::time::{Duration, Instant};

use vigil::{Poller, Readiness, Watch};

const LONG: Duration = Duration::from_secs(1);

#[test_log::test]
fn test_readable_after_peer_write() {
    let mut poller = Poller::new().unwrap();
    let (mut client, mut server) = pair();

    poller.add(raw(&client), Watch::new(Readiness::IN, 7)).unwrap();
    server.write_all(b"x").unwrap();

    let mut events = [Watch::default(); 8];
    let n = poller.wait(&mut events, 1000).unwrap();
    assert_eq!(n, 1);
    assert_eq!(events[0].token, 7);
    assert!(events[0].events.contains(Readiness::IN));

    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"x");

    assert_eq!(poller.wait(&mut events, 50).unwrap(), 0);
}

#[test_log::test]
fn test_nothing_ready_times_out() {
    let mut poller = Poller::new().unwrap();
    let (client, _server) = pair();

    poller.add(raw(&client), Watch::new(Readiness::IN, 1)).unwrap();

    let mut events = [Watch::default(); 8];
    assert_eq!(poller.wait(&mut events, 0).unwrap(), 0);
    assert_eq!(poller.wait(&mut events, 20).unwrap(), 0);
    assert_eq!(
        poller
            .wait_timeout(&mut events, Some(Duration::from_micros(300)))
            .unwrap(),
        0
    );
}

#[test_log::test]
fn test_connected_socket_is_writable() {
    let mut poller = Poller::new().unwrap();
    let (client, _server) = pair();

    poller.add(raw(&client), Watch::new(Readiness::OUT, 3)).unwrap();

    let watch = wait_for(&mut poller, 3, LONG).expect("socket never became writable");
    assert!(watch.events.contains(Readiness::OUT));
    assert!(!watch.events.contains(Readiness::IN));
}

#[test_log::test]
fn test_level_triggered_reports_until_drained() {
    let mut poller = Poller::new().unwrap();
    let (client, mut server) = pair();

    poller.add(raw(&client), Watch::new(Readiness::IN, 5)).unwrap();
    server.write_all(b"abc").unwrap();

    for _ in 0..3 {
        let watch = wait_for(&mut poller, 5, LONG).expect("readiness was not repeated");
        assert!(watch.events.contains(Readiness::IN));
    }
}

#[cfg(unix)]
#[test_log::test]
fn test_edge_triggered_reports_transitions_only() {
    let mut poller = Poller::new().unwrap();
    let (client, mut server) = pair();

    poller
        .add(raw(&client), Watch::new(Readiness::IN | Readiness::ET, 9))
        .unwrap();
    server.write_all(b"a").unwrap();

    assert!(wait_for(&mut poller, 9, LONG).is_some());
    assert!(wait_for(&mut poller, 9, Duration::from_millis(50)).is_none());

    server.write_all(b"b").unwrap();
    assert!(wait_for(&mut poller, 9, LONG).is_some());
}

#[test_log::test]
fn test_peer_shutdown_reports_read_hang_up() {
    let mut poller = Poller::new().unwrap();
    let (client, server) = pair();

    poller
        .add(raw(&client), Watch::new(Readiness::IN | Readiness::RDHUP, 2))
        .unwrap();
    server.shutdown(Shutdown::Write).unwrap();

    let watch = wait_for(&mut poller, 2, LONG).expect("shutdown was not reported");
    assert!(watch.events.contains(Readiness::RDHUP));
    assert!(watch.events.contains(Readiness::IN));
}

#[test_log::test]
fn test_token_is_echoed_verbatim() {
    let mut poller = Poller::new().unwrap();
    let (client, mut server) = pair();

    poller
        .add(raw(&client), Watch::new(Readiness::IN, u64::MAX))
        .unwrap();
    server.write_all(b"x").unwrap();

    let watch = wait_for(&mut poller, u64::MAX, LONG).expect("no report");
    assert_eq!(watch.token, u64::MAX);
}

#[test_log::test]
fn test_several_descriptors_are_reported() {
    let mut poller = Poller::new().unwrap();
    let pairs: Vec<_> = (0..4).map(|_| pair()).collect();

    for (token, (client, server)) in pairs.iter().enumerate() {
        poller
            .add(raw(client), Watch::new(Readiness::IN, token as u64))
            .unwrap();
        (&*server).write_all(b"x").unwrap();
    }

    let mut seen = HashSet::new();
    let mut events = [Watch::default(); 2];
    for _ in 0..50 {
        let n = poller.wait(&mut events, 100).unwrap();
        assert!(n <= events.len());
        seen.extend(events[..n].iter().map(|w| w.token));
        if seen.len() == pairs.len() {
            break;
        }
    }

    assert_eq!(seen, (0..4).collect::<HashSet<u64>>());
}

#[test_log::test]
fn test_peer_reset_reports_hang_up_unrequested() {
    let mut poller = Poller::new().unwrap();
    let (client, server) = pair();

    poller.add(raw(&client), Watch::new(Readiness::IN, 6)).unwrap();
    set_linger_zero(&server);
    drop(server);

    let deadline = Instant::now() + LONG;
    let mut seen = Readiness::empty();
    while !seen.contains(Readiness::HUP) && Instant::now() < deadline {
        if let Some(watch) = wait_for(&mut poller, 6, LONG) {
            seen |= watch.events;
        }
    }

    assert!(seen.contains(Readiness::HUP), "reset reported as {seen:?}");
}
