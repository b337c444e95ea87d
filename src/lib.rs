pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod signature;
pub mod status;
pub mod transport;

pub use client::{BackgroundClient, PendingCall};
pub use config::{ClientOptions, Config};
pub use dispatch::{DispatchSink, FeatureFlags, InMemoryStore};
pub use error::ClientError;
pub use model::{Envelope, Payload};
