//! Lead Engage: follow-up conversation orchestrator for CRM leads.

pub mod api;
pub mod campaign;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod lead;
pub mod llm;
pub mod orchestrator;
pub mod scoring;
pub mod store;
pub mod timers;
