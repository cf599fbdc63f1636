/*
 * Responsibility
 * - Public REST surface of the gateway (re-export of routes())
 */
pub mod dto;
pub mod handlers;
mod routes;

pub use routes::routes;
