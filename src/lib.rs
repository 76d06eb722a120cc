pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod phase;
pub mod record;
pub mod shardgate_config;
pub mod ui;
pub mod worker;
pub mod workspace;
