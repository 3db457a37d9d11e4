//! REST side: bucket keys, the rate-limit governor, and the request dispatcher.
//!
//! Every call goes through [`HttpClient::request`], which takes a lease from the
//! shared [`RateLimiter`] for the route's bucket before anything is sent.

mod client;
mod ratelimit;
mod route;

pub use client::{ApiRequest, GatewayInfo, HttpClient, SessionStartLimit};
pub use ratelimit::{BucketQuota, Lease, RateLimiter};
pub use route::bucket_key;
pub use reqwest::Method;
