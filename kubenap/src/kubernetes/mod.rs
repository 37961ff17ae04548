pub mod gateway;
pub mod watcher;
