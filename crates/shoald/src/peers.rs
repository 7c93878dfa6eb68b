//! Lazily-dialed channels to the other server ranks, reused across calls
//! and re-dialed when a connection drops.

use crate::{Error, Result};
use proto_shoal::errno;
use shoal_rpc::{Addr, Channel};
use std::collections::HashMap;

pub struct Peers {
    self_rank: u32,
    addrs: Vec<Addr>,
    channels: tokio::sync::Mutex<HashMap<u32, Channel>>,
}

impl Peers {
    pub fn new(self_rank: u32, addrs: Vec<Addr>) -> Peers {
        Peers {
            self_rank,
            addrs,
            channels: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn count(&self) -> u32 {
        self.addrs.len() as u32
    }

    pub fn self_rank(&self) -> u32 {
        self.self_rank
    }

    /// A ready channel to `rank`, dialing if needed. Callers must never ask
    /// for the local rank; local operations short-circuit before routing.
    pub async fn channel(&self, rank: u32) -> Result<Channel> {
        debug_assert_ne!(rank, self.self_rank);
        let addr = self
            .addrs
            .get(rank as usize)
            .ok_or(Error::Errno(errno::EINVAL))?
            .clone();

        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&rank) {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
            tracing::warn!(rank, "peer channel dropped; re-dialing");
            channels.remove(&rank);
        }

        let channel = Channel::connect_with_retry(&addr, None, 3).await?;
        channels.insert(rank, channel.clone());
        Ok(channel)
    }
}
