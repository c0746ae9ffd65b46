//! REST API Handlers
//!
//! `admin` serves probes and statistics; `tables` forwards everything under an
//! account to [`TableHandler`](crate::protocol::TableHandler).

pub mod admin;
pub mod tables;
