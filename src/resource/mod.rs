//! Network-first resource cache.
//!
//! Every GET goes to the network first; successful responses are captured
//! under the current cache generation and replayed when the network fails.
//! Activating a new version purges every other generation wholesale.

mod http;
mod store;
mod worker;

pub use http::{FetchError, Fetcher, HttpFetcher, Method, Request, Response};
pub use store::{ResourceEntry, ResourceStore};
pub use worker::{ResourceCache, WorkerState};
