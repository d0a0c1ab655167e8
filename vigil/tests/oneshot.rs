mod common;

use common::{pair, raw, wait_for};

use std::io::Write;
use std::time::Duration;

use vigil::{Poller, Readiness, Watch};

const LONG: Duration = Duration::from_secs(1);
const SHORT: Duration = Duration::from_millis(50);

#[test_log::test]
fn test_oneshot_fires_once_until_rearmed() {
    let mut poller = Poller::new().unwrap();
    let (client, mut server) = pair();
    let fd = raw(&client);

    poller
        .add(fd, Watch::new(Readiness::IN | Readiness::ONESHOT, 11))
        .unwrap();
    server.write_all(b"x").unwrap();

    let watch = wait_for(&mut poller, 11, LONG).expect("one-shot never fired");
    assert!(watch.events.contains(Readiness::IN));
    assert!(!watch.events.contains(Readiness::ONESHOT));

    assert!(wait_for(&mut poller, 11, SHORT).is_none());

    poller
        .modify(fd, Watch::new(Readiness::IN | Readiness::ONESHOT, 12))
        .unwrap();
    assert!(wait_for(&mut poller, 12, LONG).is_some());
    assert!(wait_for(&mut poller, 12, SHORT).is_none());
}

#[test_log::test]
fn test_oneshot_disarms_both_directions() {
    let mut poller = Poller::new().unwrap();
    let (client, mut server) = pair();
    let fd = raw(&client);

    poller
        .add(
            fd,
            Watch::new(Readiness::IN | Readiness::OUT | Readiness::ONESHOT, 3),
        )
        .unwrap();

    let watch = wait_for(&mut poller, 3, LONG).expect("one-shot never fired");
    assert!(watch.events.contains(Readiness::OUT));

    server.write_all(b"x").unwrap();
    assert!(wait_for(&mut poller, 3, SHORT).is_none());
}

#[test_log::test]
fn test_oneshot_descriptor_stays_registered() {
    let mut poller = Poller::new().unwrap();
    let (client, _server) = pair();
    let fd = raw(&client);

    poller
        .add(fd, Watch::new(Readiness::OUT | Readiness::ONESHOT, 1))
        .unwrap();
    assert!(wait_for(&mut poller, 1, LONG).is_some());

    assert!(poller.add(fd, Watch::new(Readiness::OUT, 1)).is_err());
    poller.delete(fd).unwrap();
}

#[test_log::test]
fn test_modify_turns_oneshot_into_level_triggered() {
    let mut poller = Poller::new().unwrap();
    let (client, mut server) = pair();
    let fd = raw(&client);

    poller
        .add(fd, Watch::new(Readiness::IN | Readiness::ONESHOT, 1))
        .unwrap();
    server.write_all(b"x").unwrap();

    assert!(wait_for(&mut poller, 1, LONG).is_some());
    assert!(wait_for(&mut poller, 1, SHORT).is_none());

    poller.modify(fd, Watch::new(Readiness::IN, 2)).unwrap();
    for _ in 0..3 {
        let watch = wait_for(&mut poller, 2, LONG).expect("level-triggered watch went silent");
        assert!(watch.events.contains(Readiness::IN));
    }
}
