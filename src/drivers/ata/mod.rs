//! The hard disk: state-machine driver plus the port-level backend.

pub mod driver;
pub mod pio;

use lazy_static::lazy_static;
use spin::Mutex;

pub use driver::{HdDriver, HdGeometry, MAX_ERRORS};
use pio::AtaPio;

/// Default translated geometry; the boot/setup code that reads the real
/// one from firmware lives outside this core.
pub const DEFAULT_GEOMETRY: HdGeometry = HdGeometry {
    cylinders: 1024,
    heads: 16,
    sectors: 63,
};

lazy_static! {
    pub static ref HD_DRIVER: Mutex<HdDriver<AtaPio>> = Mutex::new(HdDriver::new(
        AtaPio::new(0x1F0, 0x3F6),
        DEFAULT_GEOMETRY,
    ));
}

pub fn init() {
    // First touch arms the power-on reset/recalibrate cycle; the first
    // request will walk it.
    let _ = HD_DRIVER.lock();
    crate::log_info!("ATA disk driver ready (interrupt driven).");
}
