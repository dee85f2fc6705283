//! The `speech_rpc_gateway` core library.
//!
//! A transparent gRPC reverse proxy in front of pools of ASR and TTS engine
//! backends. Inbound calls are routed by listener authority (and, in identity
//! routing modes, by a `token` metadata entry) to a bounded, health-checked
//! connection pool, and relayed frame by frame without decoding.

pub mod config;
pub mod discovery;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod reliability;
pub mod server;
