//! REST control surface for batch runs: routes, authentication, DTOs, and
//! OpenAPI documentation.

pub mod auth;
pub mod dto;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;
