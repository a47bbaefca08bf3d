//! Fixed flash layout for ESP32 Arduino-framework images.
//!
//! Offsets encode the partition-table conventions of the target chip family and
//! are trusted as-is; nothing here checks that images fit between them.

pub const BOOTLOADER_OFFSET: u32 = 0x0000;
pub const BOOTLOADER_BIN: &str = "${BUILD_DIR}/bootloader.bin";
pub const PARTITIONS_OFFSET: u32 = 0x8000;
pub const PARTITIONS_BIN: &str = "${BUILD_DIR}/partitions.bin";
pub const BOOT_APP0_OFFSET: u32 = 0xe000;
pub const BOOT_APP0_BIN: &str =
    "${PACKAGES_DIR}/framework-arduinoespressif32/tools/partitions/boot_app0.bin";
pub const FIRMWARE_OFFSET: u32 = 0x10000;
pub const FIRMWARE_BIN: &str = "${BUILD_DIR}/${PROGNAME}.bin";
pub const SPIFFS_OFFSET: u32 = 0x290000;
pub const SPIFFS_BIN: &str = "${BUILD_DIR}/spiffs.bin";

pub const MERGED_BIN: &str = "${BUILD_DIR}/${PROGNAME}-merged.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashImage {
    pub name: &'static str,
    pub offset: u32,
    /// Path template, expanded against the project variables.
    pub source: &'static str,
}

impl FlashImage {
    /// Offset as passed to the merge tool (`0x0000`, `0x8000`, `0x10000`, ...).
    pub fn offset_arg(&self) -> String {
        format!("{:#06x}", self.offset)
    }
}

/// Ordered (offset, source) pairs handed to the merge tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashLayout {
    images: Vec<FlashImage>,
}

/// Boot-selector image shipped with the framework. Known, but not part of the merge.
pub const BOOT_APP0: FlashImage = FlashImage {
    name: "boot_app0",
    offset: BOOT_APP0_OFFSET,
    source: BOOT_APP0_BIN,
};

impl FlashLayout {
    pub fn new(images: Vec<FlashImage>) -> Self {
        Self { images }
    }

    pub fn esp32() -> Self {
        Self::new(vec![
            FlashImage {
                name: "bootloader",
                offset: BOOTLOADER_OFFSET,
                source: BOOTLOADER_BIN,
            },
            FlashImage {
                name: "partitions",
                offset: PARTITIONS_OFFSET,
                source: PARTITIONS_BIN,
            },
            FlashImage {
                name: "firmware",
                offset: FIRMWARE_OFFSET,
                source: FIRMWARE_BIN,
            },
            FlashImage {
                name: "spiffs",
                offset: SPIFFS_OFFSET,
                source: SPIFFS_BIN,
            },
        ])
    }

    pub fn images(&self) -> &[FlashImage] {
        &self.images
    }

    pub fn contains(&self, name: &str) -> bool {
        self.images.iter().any(|i| i.name == name)
    }

    /// Every image known for the target, in offset order, flagged with whether it is merged.
    pub fn catalog(&self) -> Vec<(FlashImage, bool)> {
        let mut out: Vec<(FlashImage, bool)> = self.images.iter().map(|i| (*i, true)).collect();
        if !self.contains(BOOT_APP0.name) {
            out.push((BOOT_APP0, false));
        }
        out.sort_by_key(|(i, _)| i.offset);
        out
    }
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self::esp32()
    }
}
