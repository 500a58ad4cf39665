//! Lock-table invariants exercised over the public API.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tau_core::locks::{CheckOutcome, ClaimOutcome, FileLockTable, LockEvent};

fn table_with_events(timeout: Duration) -> (FileLockTable, Arc<Mutex<Vec<LockEvent>>>) {
  let table = FileLockTable::new(timeout);
  let events = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&events);
  table.set_listener(move |e| sink.lock().unwrap().push(e.clone()));
  (table, events)
}

#[tokio::test]
async fn granted_claim_is_visible_through_check() {
  let (table, _events) = table_with_events(Duration::from_secs(5));
  assert_eq!(
    table.claim("a1", "Agent1", Path::new("/a.txt"), Some("edit".into())),
    ClaimOutcome::Granted { already_held: false }
  );
  match table.check(Path::new("/a.txt")) {
    CheckOutcome::Held {
      holder_id,
      holder_name,
      queue_length,
    } => {
      assert_eq!(holder_id, "a1");
      assert_eq!(holder_name, "Agent1");
      assert_eq!(queue_length, 0);
    }
    CheckOutcome::Available => panic!("lock not visible"),
  }
}

#[tokio::test]
async fn release_hands_over_to_head_waiter_or_empties() {
  let (table, _events) = table_with_events(Duration::from_secs(5));
  table.claim("a1", "A1", Path::new("/f"), None);
  table.claim("a2", "A2", Path::new("/f"), None);
  table.claim("a3", "A3", Path::new("/f"), None);

  // Head waiter inherits
  let release = table.release("a1", Path::new("/f"));
  assert!(release.released);
  assert_eq!(release.next_waiter.as_deref(), Some("a2"));
  assert_eq!(table.waiting_agents(Path::new("/f")), vec!["a3"]);

  // Empty queue: the path becomes available
  table.release("a2", Path::new("/f"));
  table.release("a3", Path::new("/f"));
  assert_eq!(table.check(Path::new("/f")), CheckOutcome::Available);
  assert!(table.waiting_agents(Path::new("/f")).is_empty());
}

#[tokio::test]
async fn reverse_index_always_agrees_with_locks() {
  let (table, _events) = table_with_events(Duration::from_secs(5));
  table.claim("a1", "A1", Path::new("/x"), None);
  table.claim("a1", "A1", Path::new("/y"), None);
  table.claim("a2", "A2", Path::new("/z"), None);
  table.claim("a2", "A2", Path::new("/x"), None); // queues
  table.release("a1", Path::new("/x")); // hands /x to a2

  for info in table.locks_snapshot() {
    assert!(
      table.paths_held_by(&info.holder_id).contains(&info.path),
      "reverse index missing {} for {}",
      info.path.display(),
      info.holder_id
    );
  }
  let all_held: usize = ["a1", "a2"]
    .iter()
    .map(|a| table.paths_held_by(a).len())
    .sum();
  assert_eq!(all_held, table.size());
}

#[tokio::test]
async fn timer_count_tracks_lock_count_and_dispose_zeroes_both() {
  let (table, _events) = table_with_events(Duration::from_secs(60));
  for i in 0..4 {
    table.claim("a1", "A1", Path::new(&format!("/p/{i}")), None);
  }
  assert_eq!(table.size(), 4);
  assert_eq!(table.timer_count(), 4);

  table.release("a1", Path::new("/p/0"));
  assert_eq!(table.size(), 3);
  assert_eq!(table.timer_count(), 3);

  table.dispose();
  assert_eq!(table.size(), 0);
  assert_eq!(table.timer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeouts_never_fire_on_released_paths() {
  let (table, events) = table_with_events(Duration::from_secs(5));
  table.claim("a1", "A1", Path::new("/quick"), None);
  table.release("a1", Path::new("/quick"));

  tokio::time::sleep(Duration::from_secs(10)).await;

  let seen = events.lock().unwrap();
  assert!(
    !seen.iter().any(|e| matches!(e, LockEvent::Timeout { .. })),
    "timeout fired for a released lock: {seen:?}"
  );
}

#[tokio::test(start_paused = true)]
async fn timeout_emits_and_auto_grants_exactly_once() {
  let (table, events) = table_with_events(Duration::from_secs(5));
  table.claim("a1", "A1", Path::new("/slow"), None);
  table.claim("a2", "A2", Path::new("/slow"), None);

  tokio::time::sleep(Duration::from_secs(6)).await;

  {
    let seen = events.lock().unwrap();
    let timeouts = seen
      .iter()
      .filter(|e| matches!(e, LockEvent::Timeout { .. }))
      .count();
    assert_eq!(timeouts, 1);
    assert!(seen.iter().any(
      |e| matches!(e, LockEvent::QueueGranted { agent_id, .. } if agent_id == "a2")
    ));
  }

  // a2 now holds a fresh 5 s grant; it survives another 3 s
  tokio::time::sleep(Duration::from_secs(3)).await;
  match table.check(Path::new("/slow")) {
    CheckOutcome::Held { holder_id, .. } => assert_eq!(holder_id, "a2"),
    CheckOutcome::Available => panic!("auto-granted lock expired prematurely"),
  }
}

#[tokio::test]
async fn deadlock_cycle_names_all_participants() {
  let (table, events) = table_with_events(Duration::from_secs(60));
  table.claim("a1", "A1", Path::new("/f1"), None);
  table.claim("a2", "A2", Path::new("/f2"), None);
  table.claim("a3", "A3", Path::new("/f3"), None);
  // Three-way cycle: a1 -> /f2, a2 -> /f3, a3 -> /f1
  table.claim("a1", "A1", Path::new("/f2"), None);
  table.claim("a2", "A2", Path::new("/f3"), None);
  table.claim("a3", "A3", Path::new("/f1"), None);

  let seen = events.lock().unwrap();
  let cycle = seen
    .iter()
    .find_map(|e| match e {
      LockEvent::Deadlock { cycle } => Some(cycle.clone()),
      _ => None,
    })
    .expect("deadlock detected");
  for agent in ["a1", "a2", "a3"] {
    assert!(cycle.contains(&agent.to_string()), "cycle missing {agent}: {cycle:?}");
  }
}

#[tokio::test]
async fn release_all_covers_queues_without_held_locks() {
  let (table, _events) = table_with_events(Duration::from_secs(60));
  table.claim("holder", "H", Path::new("/contested"), None);
  table.claim("waiter", "W", Path::new("/contested"), None);

  // The waiter holds nothing; release_all must still dequeue it
  let released: Vec<PathBuf> = table.release_all_for_agent("waiter");
  assert!(released.is_empty());
  assert!(table.waiting_agents(Path::new("/contested")).is_empty());

  // Later release by the holder finds no waiter left
  let outcome = table.release("holder", Path::new("/contested"));
  assert_eq!(outcome.next_waiter, None);
}
