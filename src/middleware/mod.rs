/*
 * Responsibility
 * - Public interface of the middleware layers
 * - admission (gateway ingress), internal (downstream trust), cors, http
 */
pub mod admission;
pub mod cors;
pub mod http;
pub mod internal;

pub use internal::{CurrentUser, InternalTrust};
