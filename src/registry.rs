//! Caller-owned table of named channels and pools
//!
//! There is no process-global registry: whoever hosts the endpoints owns a
//! `Registry` and decides its lifetime. Dropping it (or removing an entry)
//! drops the handle, which unlinks objects this process created.

use crate::error::{LinkError, Result};
use crate::pool::Pool;
use crate::ring::{Channel, ChannelConfig};
use std::collections::HashMap;

#[derive(Default)]
pub struct Registry {
    channels: HashMap<String, Channel>,
    pools: HashMap<String, Pool>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn vacant<T>(map: &HashMap<String, T>, name: &str) -> Result<()> {
        if map.contains_key(name) {
            return Err(LinkError::AlreadyExists {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Create a channel and keep it under `name`
    pub fn create_channel(&mut self, name: &str, config: ChannelConfig) -> Result<&Channel> {
        Self::vacant(&self.channels, name)?;
        let channel = Channel::create_with(name, config)?;
        Ok(self.channels.entry(name.to_string()).or_insert(channel))
    }

    /// Open a peer's channel and keep it under `name`
    pub fn open_channel(&mut self, name: &str) -> Result<&Channel> {
        Self::vacant(&self.channels, name)?;
        let channel = Channel::open(name)?;
        Ok(self.channels.entry(name.to_string()).or_insert(channel))
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Hand the channel back to the caller, forgetting the name
    pub fn remove_channel(&mut self, name: &str) -> Option<Channel> {
        let removed = self.channels.remove(name);
        if removed.is_some() {
            tracing::debug!(name, "channel removed from registry");
        }
        removed
    }

    /// Create a pool and keep it under `name`
    pub fn create_pool(&mut self, name: &str, size: usize) -> Result<&Pool> {
        Self::vacant(&self.pools, name)?;
        let pool = Pool::create(name, size)?;
        Ok(self.pools.entry(name.to_string()).or_insert(pool))
    }

    /// Open a peer's pool and keep it under `name`
    pub fn open_pool(&mut self, name: &str) -> Result<&Pool> {
        Self::vacant(&self.pools, name)?;
        let pool = Pool::open(name)?;
        Ok(self.pools.entry(name.to_string()).or_insert(pool))
    }

    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    pub fn remove_pool(&mut self, name: &str) -> Option<Pool> {
        let removed = self.pools.remove(name);
        if removed.is_some() {
            tracing::debug!(name, "pool removed from registry");
        }
        removed
    }

    /// Names of all registered channels
    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Names of all registered pools
    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }
}
