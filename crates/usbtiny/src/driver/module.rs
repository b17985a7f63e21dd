//! Process-wide driver load/unload

use crate::bus::{UsbBus, UsbDriver};
use crate::config::DriverSettings;
use crate::driver::UsbTinyDriver;
use crate::driver::identity::USBTINY_DEV_NAME;
use crate::error::{DriverError, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info};

/// The driver module for this process
pub static USBTINY_MODULE: DriverModule = DriverModule::new();

struct Loaded {
    bus: Arc<UsbBus>,
    driver: Arc<UsbTinyDriver>,
}

/// Loads the driver into a bus once and unloads it once
///
/// A second `init` or an `exit` without `init` is an error rather than a no-op.
pub struct DriverModule {
    loaded: Mutex<Option<Loaded>>,
}

impl DriverModule {
    pub const fn new() -> Self {
        Self {
            loaded: Mutex::new(None),
        }
    }

    /// Register the driver with `bus`
    pub fn init(&self, bus: &Arc<UsbBus>, settings: &DriverSettings) -> Result<Arc<UsbTinyDriver>> {
        let mut loaded = self.lock();
        if loaded.is_some() {
            return Err(DriverError::AlreadyLoaded);
        }

        let driver = Arc::new(UsbTinyDriver::new(settings));
        bus.register_driver(Arc::clone(&driver) as Arc<dyn UsbDriver>)
            .inspect_err(|e| {
                error!(
                    "{} driver failed to register ({})",
                    USBTINY_DEV_NAME,
                    e.errno()
                )
            })?;

        *loaded = Some(Loaded {
            bus: Arc::clone(bus),
            driver: Arc::clone(&driver),
        });
        info!("{} driver loaded", USBTINY_DEV_NAME);
        Ok(driver)
    }

    /// Deregister the driver, unbinding every device it still holds
    pub fn exit(&self) -> Result<()> {
        let Loaded { bus, driver } = self.lock().take().ok_or(DriverError::NotLoaded)?;

        bus.deregister_driver(driver.name());
        info!("{} driver unloaded", USBTINY_DEV_NAME);
        Ok(())
    }

    /// Load the driver and unload it again when the returned guard goes away
    ///
    /// Every exit path of the caller, including early error returns, then pairs the
    /// load with exactly one unload.
    pub fn load(&self, bus: &Arc<UsbBus>, settings: &DriverSettings) -> Result<LoadedModule<'_>> {
        let driver = self.init(bus, settings)?;
        Ok(LoadedModule {
            module: self,
            driver,
            unloaded: false,
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().is_some()
    }

    /// The loaded driver, if any
    pub fn driver(&self) -> Option<Arc<UsbTinyDriver>> {
        self.lock().as_ref().map(|l| Arc::clone(&l.driver))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Loaded>> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A loaded driver; dropping it unloads the module
pub struct LoadedModule<'a> {
    module: &'a DriverModule,
    driver: Arc<UsbTinyDriver>,
    unloaded: bool,
}

impl LoadedModule<'_> {
    pub fn driver(&self) -> &Arc<UsbTinyDriver> {
        &self.driver
    }

    /// Unload now, reporting failure instead of only logging it
    pub fn unload(mut self) -> Result<()> {
        self.unloaded = true;
        self.module.exit()
    }
}

impl Drop for LoadedModule<'_> {
    fn drop(&mut self) {
        if !self.unloaded
            && let Err(e) = self.module.exit()
        {
            error!("{} driver failed to unload ({})", USBTINY_DEV_NAME, e.errno());
        }
    }
}

impl Default for DriverModule {
    fn default() -> Self {
        Self::new()
    }
}
