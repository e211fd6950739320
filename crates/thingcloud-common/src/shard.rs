//! Tenant → supervisor shard routing.

use crate::error::{CloudError, Result};
use crate::protocol::TenantId;

/// Maps a tenant to one of `shard_count` shards. `shard_count` must be non-zero.
pub fn shard_for(tenant: TenantId, shard_count: usize) -> usize {
    debug_assert!(shard_count > 0);
    tenant.rem_euclid(shard_count.max(1) as i64) as usize
}

/// Listener addresses of every supervisor shard, indexed by shard id.
#[derive(Debug, Clone)]
pub struct ShardMap {
    addresses: Vec<String>,
}

impl ShardMap {
    pub fn new(addresses: Vec<String>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(CloudError::Config("at least one shard address is required".to_string()));
        }
        Ok(Self { addresses })
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn shard_for(&self, tenant: TenantId) -> usize {
        shard_for(tenant, self.addresses.len())
    }

    pub fn address(&self, shard: usize) -> Result<&str> {
        self.addresses
            .get(shard)
            .map(String::as_str)
            .ok_or(CloudError::InvalidShard {
                shard,
                count: self.addresses.len(),
            })
    }

    pub fn address_for(&self, tenant: TenantId) -> &str {
        &self.addresses[self.shard_for(tenant)]
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }
}
