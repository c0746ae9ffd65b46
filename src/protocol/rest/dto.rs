//! REST API Data Transfer Objects
//!
//! Response types for the service endpoints outside the table protocol.

use serde::Serialize;

/// JSON response: { success, data }
///
/// Admin endpoints cannot fail; table protocol errors use the OData error body.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

// Admin DTOs
/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthDto {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Server statistics response
#[derive(Debug, Serialize)]
pub struct StatsDto {
    pub tables: usize,
    pub requests: u64,
    pub batches: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}
