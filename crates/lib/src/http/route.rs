//! Rate-limit bucket identity for REST routes.
//!
//! Requests to the same route template share a bucket. Numeric id segments are
//! replaced by `{id}`, except the major parameter that follows `channels`,
//! `guilds`, or `webhooks`: quota is tracked per channel/guild/webhook, so those
//! ids stay literal. Non-numeric segments (including webhook tokens) are kept as-is.

use reqwest::Method;

const MAJOR_RESOURCES: &[&str] = &["channels", "guilds", "webhooks"];

/// Bucket key for a request: `METHOD /templated/path`.
pub fn bucket_key(method: &Method, route: &str) -> String {
    let path = route.split(['?', '#']).next().unwrap_or("");
    let mut out = String::with_capacity(path.len() + 8);
    out.push_str(method.as_str());
    out.push(' ');

    let mut prev: Option<&str> = None;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        let is_id = segment.bytes().all(|b| b.is_ascii_digit());
        let major = prev.is_some_and(|p| MAJOR_RESOURCES.contains(&p));
        if is_id && !major {
            out.push_str("{id}");
        } else {
            out.push_str(segment);
        }
        prev = Some(segment);
    }
    out
}
