//! Admission gateway: token lifecycle, session liveness and role-based admission in front
//! of internal services, plus the trust layer those services use to accept gateway traffic.
pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod middleware;
pub mod repos;
pub mod services;
pub mod state;

pub use error::AppError;
pub use middleware::{CurrentUser, InternalTrust};
pub use services::identity::Principal;
