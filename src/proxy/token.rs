//! Routing tokens.
//!
//! A token is standard base64 of a `-` separated identifier such as
//! `user01-scene01-9f2c`. The second segment names the pool or tenant the
//! call is pinned to.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::RouteError;

/// Metadata key carrying the routing token.
pub const TOKEN_METADATA_KEY: &str = "token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingToken {
    decoded: String,
    engine_id: String,
}

impl RoutingToken {
    pub fn parse(encoded: &str) -> Result<Self, RouteError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| RouteError::TokenDecode)?;
        let decoded = String::from_utf8(bytes).map_err(|_| RouteError::TokenDecode)?;

        let engine_id = decoded
            .split('-')
            .nth(1)
            .ok_or(RouteError::MalformedToken)?
            .to_string();

        Ok(Self { decoded, engine_id })
    }

    /// Identifier of the pool (dynamic mode) or tenant (tenant mode).
    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn as_str(&self) -> &str {
        &self.decoded
    }

    /// Encode an identifier the way clients do.
    pub fn encode(identifier: &str) -> String {
        STANDARD.encode(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_segment_is_engine_id() {
        let token = RoutingToken::parse(&RoutingToken::encode("user01-scene01-9f2c")).unwrap();
        assert_eq!(token.engine_id(), "scene01");
        assert_eq!(token.as_str(), "user01-scene01-9f2c");

        let two = RoutingToken::parse(&RoutingToken::encode("user01-scene02")).unwrap();
        assert_eq!(two.engine_id(), "scene02");
    }

    #[test]
    fn test_single_segment_is_malformed() {
        let encoded = RoutingToken::encode("xyz");
        assert_eq!(RoutingToken::parse(&encoded), Err(RouteError::MalformedToken));
    }

    #[test]
    fn test_invalid_base64_fails_decode() {
        assert_eq!(RoutingToken::parse("not base64!"), Err(RouteError::TokenDecode));
        // Valid base64, invalid UTF-8.
        assert_eq!(RoutingToken::parse("/w=="), Err(RouteError::TokenDecode));
    }
}
