//! Content pipeline for the digfeed discovery feed: rate-limited catalog
//! clients, random samplers, the two-stage buffer and the windowed resource
//! cache.

pub mod catalog;
pub mod channels;
pub mod client;
pub mod error;
pub mod pipeline;
pub mod resolver;
pub mod retry;
pub mod sampler;
pub mod seen;
pub mod window;

pub use catalog::{CatalogApi, DiscogsCatalog};
pub use channels::{ChannelAggregator, ChannelApi, ChannelFeed, YouTubeChannels};
pub use client::RateLimitedClient;
pub use error::{FeedError, Result};
pub use pipeline::{ContentPipeline, ItemSource, PipelineSettings};
pub use resolver::{MediaResolver, NoSearch, YouTubeSearch};
pub use retry::RetryPolicy;
pub use sampler::{CatalogSource, RandomSampler, SamplerConfig};
pub use window::{
    PositionOutOfRange, RecordSource, ResourceFactory, WindowSettings, WindowSnapshot,
    WindowedResourceCache,
};
