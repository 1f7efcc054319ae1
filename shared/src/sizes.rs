pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

/// Bytes per sector on every block device the kernel drives.
pub const SECTOR_SIZE: usize = 512;
/// Sectors reserved for the swap partition on the default disk image.
pub const SWAP_SECTORS: u32 = 8192;
pub const SWAP_SIZE: usize = SECTOR_SIZE * SWAP_SECTORS as usize;
