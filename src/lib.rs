//! coursepay - payment reconciliation and enrollment core for an online-learning platform
//!
//! This library decides, exactly once, whether a user has paid for a course and
//! should be enrolled, reconciling order state across Stripe, Mercado Pago,
//! Hotmart and Kiwify through webhooks, status polls and manual confirmation.

pub mod config;
pub mod db;
pub mod enrollment;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod id;
pub mod ledger;
pub mod middleware;
pub mod models;
pub mod payments;
pub mod sweeper;
pub mod util;
