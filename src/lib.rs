//! Overlayd - local HTTP services behind a stream overlay
//!
//! Three independent services, one per process:
//! - **streamers**: five named slots persisted to a JSON file
//! - **supervisor**: start/stop/restart/status of a single worker process
//! - **cheatsheets**: uploaded text files with metadata and HTML export
//!
//! Every service is a [`server::HttpServer`] driving one [`server::Handler`].

pub mod cheatsheets;
pub mod config;
pub mod error;
pub mod server;
pub mod storage;
pub mod streamers;
pub mod supervisor;
