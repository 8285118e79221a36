pub mod codec;
pub mod contacts;
pub mod encryption;
pub mod intake;
pub mod lifecycle;
pub mod process;
pub mod report;
pub mod results;
pub mod scoring;
pub mod store;
pub mod sweeper;
pub mod watcher;
