use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::driver::{DeviceLimits, Driver};
use crate::error::Result;
use crate::memory::{MemoryCatalog, Suballocator};

/// Entry point of the crate: wraps a driver and owns its memory catalog and sub-allocator.
///
/// Resources, views, layouts and pools are all created through a `Device`.
pub struct Device {
    driver: Arc<dyn Driver>,
    config: DeviceConfig,
    limits: DeviceLimits,
    catalog: MemoryCatalog,
    suballocator: Suballocator,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(driver: Arc<dyn Driver>, config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let limits = driver.limits();
        let catalog = MemoryCatalog::new(driver.memory_properties())?;
        let suballocator = Suballocator::new(driver.clone(), catalog.clone(), &config);
        log::debug!(
            "device ready: {} memory types in {} heaps",
            catalog.properties().types.len(),
            catalog.properties().heaps.len()
        );

        Ok(Self {
            driver,
            config,
            limits,
            catalog,
            suballocator,
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn catalog(&self) -> &MemoryCatalog {
        &self.catalog
    }

    pub fn suballocator(&self) -> &Suballocator {
        &self.suballocator
    }
}
