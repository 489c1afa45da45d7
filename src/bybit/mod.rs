//! Bybit v5 adapter: signed REST client, token-bucket rate limiter with
//! adaptive cooldown, TTL query cache, private WebSocket ingest.

pub mod cache;
pub mod private_ws;
pub mod rate_limit;
pub mod rest;
pub mod types;
