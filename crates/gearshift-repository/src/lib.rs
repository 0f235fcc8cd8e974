mod cartridge_index;
mod fs_ops;

pub use cartridge_index::CartridgeIndex;
pub use fs_ops::overlay_dir;

#[cfg(test)]
mod tests;
