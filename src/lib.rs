#![forbid(unsafe_code)]

//! Media relay: resolves YouTube metadata, scrapes TikTok pages and streams
//! video downloads straight through to the HTTP client.

pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod model;
pub mod normalize;
pub mod relay;
pub mod scraper;
pub mod stream;

#[cfg(test)]
mod testing;
