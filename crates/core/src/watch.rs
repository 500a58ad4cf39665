//! Bridge from `notify` filesystem callbacks into tokio channels, plus
//! the debounce loop all watchers share.

use std::path::Path;
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

/// Watch a directory (non-recursively) and stream its events. The
/// returned watcher must be kept alive for events to flow.
pub fn watch_dir(
  dir: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<Event>)> {
  let (tx, rx) = mpsc::unbounded_channel();
  let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
    Ok(event) => {
      let _ = tx.send(event);
    }
    Err(e) => {
      warn!(event = "watch_error", error = %e, "filesystem watch error");
    }
  })?;
  watcher.watch(dir, RecursiveMode::NonRecursive)?;
  Ok((watcher, rx))
}

/// Collect one debounced batch: the first event opens the batch, which
/// closes after `quiet` with no further events. `None` means the watcher
/// hung up.
pub async fn next_batch(
  rx: &mut mpsc::UnboundedReceiver<Event>,
  quiet: Duration,
) -> Option<Vec<Event>> {
  let first = rx.recv().await?;
  let mut events = vec![first];
  loop {
    match tokio::time::timeout(quiet, rx.recv()).await {
      Ok(Some(event)) => events.push(event),
      Ok(None) | Err(_) => return Some(events),
    }
  }
}
