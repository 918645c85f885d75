//! Endpoint table configuration and JSON persistence.

use std::path::Path;
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::backend;

/// Default number of low resource ids reserved for well-known services.
pub const DEFAULT_RESERVED_RESOURCE_IDS: u32 = 1024;

/// Smallest accepted page size.
const MIN_PAGE_SIZE: usize = 512;

/// Default ceiling on ring memory held by one table (128 MiB).
pub const DEFAULT_MAX_QUEUE_MEMORY: u64 = 128 * 1024 * 1024;

/// Tunables for an [`EndpointTable`](crate::EndpointTable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct TableConfig {
    /// Context id of this endpoint; minted handles use it as their context.
    pub context_id: u32,
    /// Page size used to round ring allocations.
    pub page_size: usize,
    /// Resource ids below this value are never minted.
    pub reserved_resource_ids: u32,
    /// Upper bound on the sum of ring capacities across live queue pairs.
    pub max_queue_memory: u64,
    /// Capacity hint for the failed-conversion handle set.
    pub failed_set_capacity: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            context_id: qpair_proto::INVALID_ID,
            page_size: backend::page_size(),
            reserved_resource_ids: DEFAULT_RESERVED_RESOURCE_IDS,
            max_queue_memory: DEFAULT_MAX_QUEUE_MEMORY,
            failed_set_capacity: 4,
        }
    }
}

impl TableConfig {
    /// Loads a configuration from a JSON file. Missing fields take their
    /// defaults.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Persists the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Rejects values the table cannot operate with.
    pub fn validate(&self) -> io::Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "page_size {} is not a power of two of at least {MIN_PAGE_SIZE}",
                    self.page_size
                ),
            ));
        }
        if self.reserved_resource_ids == qpair_proto::INVALID_ID {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reserved_resource_ids leaves no mintable ids",
            ));
        }
        Ok(())
    }
}
