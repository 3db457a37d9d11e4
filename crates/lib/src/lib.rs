//! Wumpus core library: the realtime gateway session and the rate-limited
//! REST dispatcher, shared by the CLI and any bot built on top.

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod intents;
pub mod snowflake;
