//! Block-device layer: the request queue and the disk driver behind it.

pub mod ata;
pub mod blkdev;

pub fn init() {
    ata::init();
    crate::log_info!("Block request queue ready ({} slots).", blkdev::NR_REQUEST);
}
