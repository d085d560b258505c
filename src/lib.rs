// chat-loadgen - Library root for testing

pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod mock_server;
pub mod models;
pub mod population;
pub mod report;
pub mod session;
pub mod streaming;
pub mod trace;
pub mod utils;
