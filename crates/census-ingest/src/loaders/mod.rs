//! Metadata and geography loaders
//!
//! Both loaders are all-or-nothing: the first call that exhausts its retries
//! aborts the whole load and nothing partial is returned.

pub mod geography;
pub mod metadata;

use census_common::Result;
use std::future::Future;
use std::sync::Arc;

use crate::client::CensusSource;
use crate::executor::WorkerPool;
use crate::retry::RetryPolicy;

pub use geography::GeographyLoader;
pub use metadata::{MetadataCatalog, MetadataLoader};

/// A [`CensusSource`] reached through the retry policy and the network pool
#[derive(Clone)]
pub struct Upstream {
    source: Arc<dyn CensusSource>,
    network: WorkerPool,
    retry: RetryPolicy,
}

impl Upstream {
    pub fn new(source: Arc<dyn CensusSource>, network: WorkerPool, retry: RetryPolicy) -> Self {
        Self {
            source,
            network,
            retry,
        }
    }

    /// Issue `call` with retries; every attempt takes its own network slot
    pub async fn call<'a, T, F, Fut>(&'a self, operation: &'a str, call: F) -> Result<T>
    where
        F: Fn(&'a dyn CensusSource) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let source: &'a dyn CensusSource = self.source.as_ref();
        self.retry
            .run(operation, || self.network.run(operation, call(source)))
            .await
    }
}
