pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod job;
pub mod payload;
pub mod process;
pub mod scenario;
pub mod sink;
pub mod testutil;
pub mod worker;
