//! Resolves a video URL to a fetchable media stream and caches it in object storage.
//!
//! ```no_run
//! use youtube_resolver::{Pipeline, ResolverConfig};
//!
//! # async fn run() -> youtube_resolver::ResolveResult<()> {
//! let config = ResolverConfig::load("resolver.toml")?;
//! let pipeline = Pipeline::from_config(&config)?;
//! if let Some(outcome) = pipeline.run("https://youtu.be/dQw4w9WgXcQ").await? {
//!     println!("{:?}", outcome.asset().map(|a| &a.url));
//! }
//! # Ok(())
//! # }
//! ```

pub mod downloader;

pub use downloader::identifier::parse as parse_identifier;
pub use downloader::*;
