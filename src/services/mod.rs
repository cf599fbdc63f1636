/*
 * Responsibility
 * - Domain services: tokens, sessions, permissions, the admission pipeline, forwarding
 * - No axum routing here; handlers and middleware call into these
 */
pub mod auth;
pub mod cache;
pub mod identity;
pub mod pattern;
pub mod permission;
pub mod pipeline;
pub mod proxy;
pub mod request_path;
pub mod session;
pub mod whitelist;
