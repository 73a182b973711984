//! Search operation parameters and the tag select mask.

use crate::codec::{search_options, SearchMode, SearchRequest};
use crate::error::{Result, RtlsError};
use crate::protocol::DeviceId;

/// Highest accepted transmit power level.
pub const MAX_POWER_LEVEL: u8 = 30;

/// Transmit power level used until changed.
pub const DEFAULT_POWER_LEVEL: u8 = 20;

/// Parameters of one search operation.
///
/// Stored by the provider from a successful `start_operation` until the
/// next one replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationParams {
    /// Open toggling search reporting every tag in range.
    Inventory {
        led_blink: bool,
        mask: Option<DeviceId>,
        /// End the operation after this many tags; `0` runs until stopped.
        stop_after: u32,
    },
    /// Open search that also requests ranging telemetry.
    Ranging {
        led_blink: bool,
        mask: Option<DeviceId>,
    },
    /// Single-tag proximity search with smoothing.
    Searching {
        led_blink: bool,
        /// Tag to track.
        mask: DeviceId,
        /// Rolling minimum window.
        rolling_window: usize,
    },
    /// Read tag user data; results are forwarded unfiltered.
    Read {
        led_blink: bool,
        mask: Option<DeviceId>,
    },
}

impl OperationParams {
    /// Inventory of all tags, run until stopped.
    pub fn inventory() -> Self {
        OperationParams::Inventory {
            led_blink: false,
            mask: None,
            stop_after: 0,
        }
    }

    /// Track one tag with the given rolling window.
    pub fn searching(tag: DeviceId, rolling_window: usize) -> Self {
        OperationParams::Searching {
            led_blink: false,
            mask: tag,
            rolling_window,
        }
    }

    pub fn mode(&self) -> SearchMode {
        match self {
            OperationParams::Inventory { .. } => SearchMode::Inventory,
            OperationParams::Ranging { .. } => SearchMode::Ranging,
            OperationParams::Searching { .. } => SearchMode::Searching,
            OperationParams::Read { .. } => SearchMode::Read,
        }
    }

    pub fn led_blink(&self) -> bool {
        match self {
            OperationParams::Inventory { led_blink, .. }
            | OperationParams::Ranging { led_blink, .. }
            | OperationParams::Searching { led_blink, .. }
            | OperationParams::Read { led_blink, .. } => *led_blink,
        }
    }

    /// Tag id the search is restricted to, if any.
    pub fn mask(&self) -> Option<DeviceId> {
        match self {
            OperationParams::Inventory { mask, .. }
            | OperationParams::Ranging { mask, .. }
            | OperationParams::Read { mask, .. } => *mask,
            OperationParams::Searching { mask, .. } => Some(*mask),
        }
    }

    /// Reject parameters the device cannot act on.
    pub fn validate(&self) -> Result<()> {
        if let OperationParams::Searching {
            mask,
            rolling_window,
            ..
        } = self
        {
            if *mask == DeviceId::default() {
                return Err(RtlsError::InvalidParameter(
                    "searching requires a tag id".into(),
                ));
            }
            if *rolling_window == 0 {
                return Err(RtlsError::InvalidParameter(
                    "rolling window must be non-zero".into(),
                ));
            }
        }
        Ok(())
    }

    /// Option bits for the search command.
    pub fn options(&self) -> u8 {
        let mut options = match self {
            OperationParams::Inventory { .. } | OperationParams::Ranging { .. } => {
                search_options::TOGGLE_SESSION
            }
            OperationParams::Searching { .. } => search_options::SINGLE_TAG,
            OperationParams::Read { mask, .. } if mask.is_some() => search_options::SINGLE_TAG,
            OperationParams::Read { .. } => 0,
        };
        if self.led_blink() {
            options |= search_options::LED_BLINK;
        }
        options
    }

    /// Build the search command payload.
    pub fn search_request(&self, search_index: u8, power_level: u8, back_off: u8) -> SearchRequest {
        SearchRequest {
            search_index,
            mode: self.mode(),
            options: self.options(),
            power_level,
            back_off,
            tag_mask: self.mask().unwrap_or_default(),
        }
    }
}

/// Bit-range filter applied to the 48-bit id of reported tags.
///
/// Bits are numbered from the most significant bit of the first id byte.
/// The first `bit_count` bits of `mask` must equal the id bits starting at
/// `bit_offset`. A zero `bit_count` matches every tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectMask {
    bit_offset: u8,
    bit_count: u8,
    mask: Vec<u8>,
}

impl SelectMask {
    /// # Errors
    ///
    /// Returns `InvalidParameter` when the range exceeds 48 bits or the
    /// mask is too short for `bit_count`.
    pub fn new(bit_offset: u8, bit_count: u8, mask: impl Into<Vec<u8>>) -> Result<Self> {
        let mask = mask.into();
        let end = bit_offset as usize + bit_count as usize;
        if end > DeviceId::BITS {
            return Err(RtlsError::InvalidParameter(format!(
                "select range {}..{} exceeds {} bits",
                bit_offset,
                end,
                DeviceId::BITS
            )));
        }
        let needed = (bit_count as usize).div_ceil(8);
        if mask.len() < needed {
            return Err(RtlsError::InvalidParameter(format!(
                "select mask needs {} bytes for {} bits, got {}",
                needed,
                bit_count,
                mask.len()
            )));
        }
        Ok(Self {
            bit_offset,
            bit_count,
            mask,
        })
    }

    /// Mask that accepts every tag.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match a whole tag id.
    pub fn exact(tag: DeviceId) -> Self {
        Self {
            bit_offset: 0,
            bit_count: DeviceId::BITS as u8,
            mask: tag.as_bytes().to_vec(),
        }
    }

    pub fn bit_offset(&self) -> u8 {
        self.bit_offset
    }

    pub fn bit_count(&self) -> u8 {
        self.bit_count
    }

    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    pub fn matches(&self, tag: &DeviceId) -> bool {
        (0..self.bit_count as usize).all(|i| {
            let want = self.mask[i / 8] & (0x80 >> (i % 8)) != 0;
            tag.bit(self.bit_offset as usize + i) == want
        })
    }
}

/// Validate a transmit power level.
pub(crate) fn check_power_level(level: u8) -> Result<()> {
    if level > MAX_POWER_LEVEL {
        return Err(RtlsError::InvalidParameter(format!(
            "power level {} above maximum {}",
            level, MAX_POWER_LEVEL
        )));
    }
    Ok(())
}
