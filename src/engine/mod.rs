pub mod delivery;
pub mod reconciler;
pub mod scanner;
pub mod scheduler;
pub mod watcher;
