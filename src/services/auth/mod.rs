pub mod codec;
pub mod password;
pub mod token_service;

pub use codec::{TokenClaims, TokenCodec, TokenType, fingerprint};
pub use token_service::{IssuedTokenPair, TokenService, token_error};
