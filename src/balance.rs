//! Round-robin selection over a set of dialers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::client::{Dialer, DynDialer};
use crate::error::{ProxyError, Result};
use crate::stream::ProxyStream;

/// Cyclic pick, no health checking, no retry.
pub fn new_round_robin(dialers: Vec<DynDialer>) -> Result<DynDialer> {
    if dialers.is_empty() {
        return Err(ProxyError::NoDialers);
    }
    Ok(Arc::new(RoundRobin {
        dialers,
        next: AtomicUsize::new(0),
    }))
}

struct RoundRobin {
    dialers: Vec<DynDialer>,
    next: AtomicUsize,
}

#[async_trait]
impl Dialer for RoundRobin {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.dialers.len();
        self.dialers[index].dial(network, address).await
    }
}
