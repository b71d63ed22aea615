pub mod api;
pub mod cluster;
pub mod controller;
pub mod engine;
pub mod exec;
pub mod helm;
pub mod inflight;
pub mod labels;
pub mod metrics;
pub mod node_ledger;
pub mod operations;
pub mod port_allocator;
pub mod port_parser;
pub mod retry;
pub mod runtime_info;
pub mod settings;
pub mod trace;
pub mod units;

pub use ddc_macros::test;
