//! Last-known-good values for reads that must keep answering while the
//! store is failing.

use std::collections::HashMap;

use mrgc_state::{RegionSnapshot, ScalingRecord, StateResult};
use tokio::sync::RwLock;
use tracing::warn;

/// A value plus whether it came from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Served<T> {
    pub value: T,
    pub stale: bool,
}

#[derive(Debug, Default)]
pub struct LastKnownGood {
    regions: RwLock<HashMap<String, RegionSnapshot>>,
    scaling: RwLock<HashMap<String, Vec<ScalingRecord>>>,
}

impl LastKnownGood {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a snapshot read, falling back to the cache when it failed.
    ///
    /// `Ok(None)` means the region has never been seen.
    pub async fn region(
        &self,
        region: &str,
        read: StateResult<Option<RegionSnapshot>>,
    ) -> StateResult<Option<Served<RegionSnapshot>>> {
        match read {
            Ok(Some(snapshot)) => {
                self.regions
                    .write()
                    .await
                    .insert(region.to_string(), snapshot.clone());
                Ok(Some(Served {
                    value: snapshot,
                    stale: false,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => match self.regions.read().await.get(region) {
                Some(cached) => {
                    warn!(%region, error = %e, "serving last-known-good region snapshot");
                    Ok(Some(Served {
                        value: cached.clone(),
                        stale: true,
                    }))
                }
                None => Err(e),
            },
        }
    }

    /// Serve a scaling history read, falling back to the cache when it failed.
    pub async fn scaling(
        &self,
        pool: &str,
        read: StateResult<Vec<ScalingRecord>>,
    ) -> StateResult<Served<Vec<ScalingRecord>>> {
        match read {
            Ok(records) => {
                self.scaling
                    .write()
                    .await
                    .insert(pool.to_string(), records.clone());
                Ok(Served {
                    value: records,
                    stale: false,
                })
            }
            Err(e) => match self.scaling.read().await.get(pool) {
                Some(cached) => {
                    warn!(%pool, error = %e, "serving last-known-good scaling history");
                    Ok(Served {
                        value: cached.clone(),
                        stale: true,
                    })
                }
                None => Err(e),
            },
        }
    }
}
