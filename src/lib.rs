//! Pixelgate - Conversion event reconciliation pipeline
//!
//! Ingests e-commerce order webhooks and client-side pixel receipts,
//! gates conversions on billing quota and consent, and delivers them to
//! advertising destinations with verification reporting on top.

pub mod billing;
pub mod config;
pub mod consent;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod platforms;
pub mod rate_limit;
pub mod util;
pub mod verification;
pub mod worker;
