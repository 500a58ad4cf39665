mod model;
mod store;
mod watcher;

pub use model::{Task, TaskStatus, parse_tasks, serialize_tasks};
pub use store::{TaskStore, TaskStoreError};
pub use watcher::{TaskWatcher, TaskWatcherDeps};
