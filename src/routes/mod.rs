//! HTTP route handlers grouped by resource domain.
//!
//! Each submodule exposes typed Rocket handlers annotated with
//! `#[openapi]` so `rocket_okapi` can derive an OpenAPI document
//! automatically.

pub mod health;
pub mod imports;
