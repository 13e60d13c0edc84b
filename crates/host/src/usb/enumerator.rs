//! Device discovery
//!
//! Polls the bus until a device with the wanted vendor id and one of the
//! accepted product ids shows up, then opens it.

use common::{Clock, Error, Result, UsbBackend};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Deadline-bounded device locator
pub struct Enumerator<B: UsbBackend> {
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl<B: UsbBackend> Enumerator<B> {
    pub fn new(backend: Arc<B>, clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self {
            backend,
            clock,
            poll_interval,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Open the first device matching `vendor_id` and one of `product_ids`
    ///
    /// Devices of the right vendor with another product id are logged and
    /// skipped. Between empty snapshots the enumerator sleeps for the poll
    /// interval, cut short at the deadline, so the call returns at most one
    /// poll interval after `timeout`.
    pub fn locate(
        &self,
        vendor_id: u16,
        product_ids: &[u16],
        timeout: Duration,
    ) -> Result<B::Handle> {
        let start = self.clock.now();
        let deadline = start + timeout;

        loop {
            let devices = self.backend.devices().map_err(Error::Enumeration)?;
            debug!("Enumerated {} devices", devices.len());

            for candidate in devices.iter().filter(|c| c.vendor_id == vendor_id) {
                info!(
                    "Found device {:04x}:{:04x} at bus {} address {}",
                    candidate.vendor_id,
                    candidate.product_id,
                    candidate.bus_number,
                    candidate.device_address
                );

                if !product_ids.contains(&candidate.product_id) {
                    info!(
                        "Product id {:04x} is not an accepted product id, skipping",
                        candidate.product_id
                    );
                    continue;
                }

                let handle = self.backend.open(candidate).map_err(|source| Error::Open {
                    vendor_id: candidate.vendor_id,
                    product_id: candidate.product_id,
                    source,
                })?;
                return Ok(handle);
            }

            let now = self.clock.now();
            if now >= deadline {
                return Err(Error::DiscoveryTimeout {
                    vendor_id,
                    product_ids: product_ids.to_vec(),
                    waited: now.saturating_duration_since(start),
                });
            }
            self.clock.sleep(self.poll_interval.min(deadline - now));
        }
    }
}
