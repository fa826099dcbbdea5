pub mod analysis;
pub mod config;
pub mod controller;
pub mod dashboard;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod merge;
pub mod oracle;
pub mod sandbox;
pub mod telemetry;
pub mod ui;
pub mod util;
pub mod vcs;

#[cfg(test)]
pub mod testing;
