//! Bulk catalog pipeline for multi-tenant product passports.
//!
//! Asynchronous import/export jobs driven through a durable state
//! machine, field-ownership reconciliation across data sources, and
//! integration promotion. The web surface consumes this crate through
//! [`service::PipelineService`] and [`push::PushGateway`].

pub mod config;
pub mod connector;
pub mod db;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod ownership;
pub mod processor;
pub mod progress;
pub mod push;
pub mod service;
pub mod source;
