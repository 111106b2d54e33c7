pub const KB: usize = 1024;
pub const MB: usize = KB * KB;

pub const SECTOR_SIZE: u32 = 512;
/// Size of the default swap partition: 1024 page-sized slots.
pub const SWAP_SECTORS: u32 = 8192;
