//! Loaded-module records.

/// One loaded image in the debuggee.
#[derive(Debug, Clone)]
pub struct Module {
    pub image_base: u64,
    pub preferred_image_base: u64,
    pub size: u32,
    /// Raw machine type from the image header (IMAGE_FILE_MACHINE_* style).
    pub machine: u16,
    pub path: String,
    /// Offset/size of the debug info directory in the image file, when the
    /// loader reported one.
    pub debug_info_offset: u32,
    pub debug_info_size: u32,
    /// Set on unload; the record stays addressable until the process goes.
    pub deleted: bool,
}

impl Module {
    pub fn new(image_base: u64, size: u32, path: String) -> Self {
        Module {
            image_base,
            preferred_image_base: image_base,
            size,
            machine: 0,
            path,
            debug_info_offset: 0,
            debug_info_size: 0,
            deleted: false,
        }
    }

    /// Whether `address` falls inside this image's mapped range.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.image_base && address < self.image_base + self.size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_half_open() {
        let module = Module::new(0x40_0000, 0x1000, "a.exe".into());
        assert!(module.contains(0x40_0000));
        assert!(module.contains(0x40_0FFF));
        assert!(!module.contains(0x40_1000));
        assert!(!module.contains(0x3F_FFFF));
    }
}
