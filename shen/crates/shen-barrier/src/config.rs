//! Configuration Module - Barrier Emission Parameters
//!
//! Everything the emitters need to know about the runtime they generate code
//! for: thread-block offsets, the collection-set table, the reference
//! encoding, and the diagnostic switches. All values are supplied by the
//! runtime; none are hardcoded in emitted code paths.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Offsets of the barrier fields inside the per-thread block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadLayout {
    /// GC-state byte
    ///
    /// Default: 0x28
    pub gc_state_offset: i32,

    /// SATB queue index: bytes of free space left in the buffer
    ///
    /// Default: 0x18
    pub satb_index_offset: i32,

    /// SATB queue buffer base pointer
    ///
    /// Default: 0x20
    pub satb_buffer_offset: i32,

    /// Thread-local card table base (generational mode)
    ///
    /// Default: 0x30
    pub card_table_offset: i32,
}

impl Default for ThreadLayout {
    fn default() -> Self {
        Self {
            gc_state_offset: 0x28,
            satb_index_offset: 0x18,
            satb_buffer_offset: 0x20,
            card_table_offset: 0x30,
        }
    }
}

impl ThreadLayout {
    /// Bytes of thread block covered by the barrier fields
    pub fn extent(&self) -> i32 {
        self.fields().map(|(_, offset, width)| offset + width).max().unwrap_or(0)
    }

    fn fields(&self) -> impl Iterator<Item = (&'static str, i32, i32)> {
        [
            ("gc_state_offset", self.gc_state_offset, 1),
            ("satb_index_offset", self.satb_index_offset, WORD),
            ("satb_buffer_offset", self.satb_buffer_offset, WORD),
            ("card_table_offset", self.card_table_offset, WORD),
        ]
        .into_iter()
    }
}

/// Global heap geometry consumed by barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapLayout {
    /// Biased collection-set table base
    ///
    /// The cset byte of an object lives at `(addr >> region_size_shift) + cset_table_base`.
    /// Default: 0x5fff_c000
    pub cset_table_base: u64,

    /// log2 of the region size
    ///
    /// Default: 21 (2MB regions)
    pub region_size_shift: u8,

    /// log2 of the card size (generational mode)
    ///
    /// Default: 9 (512-byte cards)
    pub card_shift: u8,
}

impl Default for HeapLayout {
    fn default() -> Self {
        Self { cset_table_base: 0x5fff_c000, region_size_shift: 21, card_shift: 9 }
    }
}

/// Compressed reference encoding: `addr = base + (narrow << shift)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OopEncoding {
    pub base: u64,
    pub shift: u8,
}

impl OopEncoding {
    /// Heap-based encoding used when compressed oops are switched on without
    /// further detail
    pub const DEFAULT: OopEncoding = OopEncoding { base: 0x8_0000_0000, shift: 3 };

    pub fn encode(&self, addr: u64) -> u32 {
        if addr == 0 {
            0
        } else {
            ((addr - self.base) >> self.shift) as u32
        }
    }

    pub fn decode(&self, narrow: u32) -> u64 {
        if narrow == 0 {
            0
        } else {
            self.base + ((narrow as u64) << self.shift)
        }
    }

    /// Decoding is the identity on the zero-extended narrow value
    pub fn is_trivial(&self) -> bool {
        self.base == 0 && self.shift == 0
    }
}

/// Barrier configuration for one compilation session
///
/// # Examples
///
/// ```rust
/// use shen_barrier::BarrierConfig;
///
/// let config = BarrierConfig {
///     verify_oops: true,
///     slow_path_only: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierConfig {
    /// Verify previous values before logging them
    ///
    /// Diagnostic only. Emits a call to the verify stub on every logged value.
    /// Default: false
    pub verify_oops: bool,

    /// Send every pre-write barrier to the runtime stub
    ///
    /// Skips the inline SATB buffer write. Used to verify the stub path.
    /// Default: false
    pub slow_path_only: bool,

    /// Compressed reference encoding, `None` for full-width references
    ///
    /// Default: None
    pub compressed_oops: Option<OopEncoding>,

    /// Generational mode: reference stores also dirty cards
    ///
    /// Default: false
    pub generational: bool,

    /// Skip the card store when the card is already dirty
    ///
    /// Default: false
    pub conditional_card_mark: bool,

    /// Stubs may be out of direct branch range
    ///
    /// On AArch64 far calls go through a scratch register.
    /// Default: false
    pub far_stub_calls: bool,

    /// Thread-block layout
    pub thread: ThreadLayout,

    /// Heap geometry
    pub heap: HeapLayout,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            verify_oops: false,
            slow_path_only: false,
            compressed_oops: None,
            generational: false,
            conditional_card_mark: false,
            far_stub_calls: false,
            thread: ThreadLayout::default(),
            heap: HeapLayout::default(),
        }
    }
}

impl BarrierConfig {
    /// Validate configuration
    ///
    /// Returns error if the layout is inconsistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Thread block
        let fields: Vec<_> = self.thread.fields().collect();
        for (name, offset, width) in &fields {
            if *offset < 0 {
                return Err(ConfigError::InvalidOffset(format!("{} must be >= 0", name)));
            }
            if *width == WORD && offset % WORD != 0 {
                return Err(ConfigError::InvalidOffset(format!("{} must be word aligned", name)));
            }
        }
        for (i, (a, a_off, a_width)) in fields.iter().enumerate() {
            for (b, b_off, b_width) in &fields[i + 1..] {
                if a_off < &(b_off + b_width) && b_off < &(a_off + a_width) {
                    return Err(ConfigError::InvalidOffset(format!("{} overlaps {}", a, b)));
                }
            }
        }

        // Heap geometry
        if self.heap.cset_table_base == 0 {
            return Err(ConfigError::InvalidTable("cset_table_base must be set".to_string()));
        }

        if !(MIN_REGION_SHIFT..=MAX_REGION_SHIFT).contains(&self.heap.region_size_shift) {
            return Err(ConfigError::InvalidShift(format!(
                "region_size_shift must be between {} and {}",
                MIN_REGION_SHIFT, MAX_REGION_SHIFT
            )));
        }

        if !(MIN_CARD_SHIFT..=MAX_CARD_SHIFT).contains(&self.heap.card_shift) {
            return Err(ConfigError::InvalidShift(format!(
                "card_shift must be between {} and {}",
                MIN_CARD_SHIFT, MAX_CARD_SHIFT
            )));
        }

        // Reference encoding
        if let Some(encoding) = self.compressed_oops {
            if encoding.shift > MAX_OOP_SHIFT {
                return Err(ConfigError::InvalidEncoding(format!(
                    "compressed oop shift must be <= {}",
                    MAX_OOP_SHIFT
                )));
            }
            if encoding.base & ((1u64 << 32) - 1) != 0 {
                return Err(ConfigError::InvalidEncoding(
                    "compressed oop base must be 4GB aligned".to_string(),
                ));
            }
        }

        if self.conditional_card_mark && !self.generational {
            return Err(ConfigError::InvalidCombination(
                "conditional_card_mark requires generational mode".to_string(),
            ));
        }

        Ok(())
    }

    /// Create config from environment variables
    ///
    /// Reads:
    /// - SHEN_VERIFY_BARRIERS
    /// - SHEN_SLOW_PATH_ONLY
    /// - SHEN_COMPRESSED_OOPS
    /// - SHEN_GENERATIONAL
    /// - SHEN_FAR_STUB_CALLS
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields with any of the `SHEN_*` variables that are set
    pub fn apply_env(&mut self) {
        if let Some(flag) = env_flag("SHEN_VERIFY_BARRIERS") {
            self.verify_oops = flag;
        }

        if let Some(flag) = env_flag("SHEN_SLOW_PATH_ONLY") {
            self.slow_path_only = flag;
        }

        if let Some(flag) = env_flag("SHEN_COMPRESSED_OOPS") {
            self.compressed_oops = flag.then_some(OopEncoding::DEFAULT);
        }

        if let Some(flag) = env_flag("SHEN_GENERATIONAL") {
            self.generational = flag;
        }

        if let Some(flag) = env_flag("SHEN_FAR_STUB_CALLS") {
            self.far_stub_calls = flag;
        }
    }

    /// Size of a reference slot in the heap
    pub fn oop_size(&self) -> u32 {
        if self.compressed_oops.is_some() {
            4
        } else {
            8
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid thread offset: {0}")]
    InvalidOffset(String),

    #[error("Invalid table: {0}")]
    InvalidTable(String),

    #[error("Invalid shift: {0}")]
    InvalidShift(String),

    #[error("Invalid oop encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid combination: {0}")]
    InvalidCombination(String),
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

const WORD: i32 = 8;
const MIN_REGION_SHIFT: u8 = 12;
const MAX_REGION_SHIFT: u8 = 30;
const MIN_CARD_SHIFT: u8 = 5;
const MAX_CARD_SHIFT: u8 = 12;
const MAX_OOP_SHIFT: u8 = 3;

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|val| val == "1" || val.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BarrierConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.verify_oops);
        assert!(!config.slow_path_only);
        assert_eq!(config.oop_size(), 8);
    }

    #[test]
    fn test_overlapping_offsets_rejected() {
        let mut config = BarrierConfig::default();
        config.thread.gc_state_offset = config.thread.satb_index_offset + 3;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidOffset(_))));
    }

    #[test]
    fn test_misaligned_word_offset_rejected() {
        let mut config = BarrierConfig::default();
        config.thread.satb_buffer_offset = 0x44;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidOffset(_))));
    }

    #[test]
    fn test_region_shift_bounds() {
        let mut config = BarrierConfig::default();
        config.heap.region_size_shift = 40;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidShift(_))));
    }

    #[test]
    fn test_oop_encoding_bounds() {
        let mut config = BarrierConfig::default();
        config.compressed_oops = Some(OopEncoding { base: 0, shift: 4 });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEncoding(_))));

        config.compressed_oops = Some(OopEncoding { base: 0x1000, shift: 3 });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEncoding(_))));

        config.compressed_oops = Some(OopEncoding::DEFAULT);
        assert!(config.validate().is_ok());
        assert_eq!(config.oop_size(), 4);
    }

    #[test]
    fn test_conditional_card_mark_needs_generational() {
        let config = BarrierConfig { conditional_card_mark: true, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidCombination(_))));
    }

    #[test]
    fn test_oop_encoding_round_trip_preserves_null() {
        let enc = OopEncoding::DEFAULT;
        assert_eq!(enc.encode(0), 0);
        assert_eq!(enc.decode(0), 0);
        let addr = enc.base + 0x1238;
        assert_eq!(enc.decode(enc.encode(addr)), addr);
    }

    #[test]
    fn test_thread_extent() {
        assert_eq!(ThreadLayout::default().extent(), 0x38);
    }

    #[test]
    fn test_partial_toml_style_deserialize() {
        let json = r#"{ "verify_oops": true, "thread": { "gc_state_offset": 64 } }"#;
        let config: BarrierConfig = serde_json::from_str(json).unwrap();
        assert!(config.verify_oops);
        assert_eq!(config.thread.gc_state_offset, 64);
        assert_eq!(config.thread.satb_index_offset, 0x18);
        assert_eq!(config.heap, HeapLayout::default());
    }
}
