pub mod cli;
pub mod config;
pub mod journaling;
pub mod storage;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use journaling::{Draft, DraftEvent, DraftSession, EntryGateway, SaveStatus};
