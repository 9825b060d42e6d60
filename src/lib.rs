pub mod app;
pub mod biological;
pub mod config;
pub mod domain;
pub mod error;
pub mod layout;
pub mod metadata;
pub mod orchestrator;
pub mod output;
pub mod query;
pub mod report;
pub mod resolver;
pub mod tools;
pub mod worker;
pub mod xref;
