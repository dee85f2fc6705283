//! The proxy data path.
//!
//! Calls arrive on a per-family listener, are routed by the director to a
//! leased backend channel, and are relayed frame by frame through the
//! pass-through codec without decoding the payload.

pub mod codec;
pub mod director;
pub mod server;
pub mod token;

pub use codec::{Frame, FrameCodec, PassThroughCodec, Payload, Proto};
pub use director::{RouteDecision, RouteTarget, RoutingDirector};
pub use server::{parse_grpc_timeout, route_label, ProxyServer, DIAGNOSTIC_METHODS};
pub use token::{RoutingToken, TOKEN_METADATA_KEY};
