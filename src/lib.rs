pub mod aggregate;
pub mod cci;
pub mod config;
pub mod domain;
pub mod error;
pub mod exposure;
pub mod geometry;
pub mod http;
pub mod layers;
pub mod ledger;
pub mod output;
pub mod pipeline;
pub mod providers;
pub mod report;
pub mod severity;
pub mod store;
