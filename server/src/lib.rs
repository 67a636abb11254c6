//! Webhook relay between a CRM chat channel and an assistant thread.
//!
//! Each call reconciles the CRM history against the message that triggered
//! it, runs the assistant on the new turns and answers with either a reply or
//! a stop action for the CRM workflow.

pub mod app;
pub mod assistant;
pub mod classify;
pub mod config;
pub mod crm;
pub mod error;
pub mod gate;
pub mod logging;
pub mod reconcile;
pub mod tokens;
pub mod types;
