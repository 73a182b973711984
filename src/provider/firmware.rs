//! Firmware upgrade session.
//!
//! The image is sent in fixed 64-byte blocks, one per acknowledgement. A
//! failed block rolls the transfer back to block `index / 8` and resends
//! from there; after ten failures in one session the transfer is abandoned.

use bytes::Bytes;

use crate::codec::{BlockAck, BlockWrite, EnterUpgradeRequest, ErrorCode};
use crate::error::{Result, RtlsError};

/// Image bytes per block.
pub const BLOCK_SIZE: usize = 64;

/// Largest image, in blocks, the bootloader accepts.
pub const MAX_BLOCKS: usize = 1023;

/// Failed block acknowledgements tolerated per session.
pub const MAX_RETRIES: u32 = 10;

/// Divisor applied to the block index on a failed acknowledgement.
pub const ROLLBACK_DIVISOR: u16 = 8;

/// Fill byte for the tail of the last block.
const PADDING: u8 = 0xFF;

/// What to do after a block acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockStep {
    /// Send the next block and report progress.
    Send { block: BlockWrite, percent: u8 },
    /// Every block is acknowledged; waiting for the info commit.
    AwaitCommit,
    /// Resend from the rolled-back index.
    Retry { block: BlockWrite, retries: u32 },
    Succeeded,
    Failed { percent: u8, error: ErrorCode },
    /// Acknowledgement after the session ended.
    Ignored,
}

/// State of one firmware transfer.
#[derive(Debug, Clone)]
pub(crate) struct FirmwareSession {
    image: Bytes,
    total_blocks: u16,
    /// Block to send or being acknowledged.
    index: u16,
    retries: u32,
    finished: bool,
    /// The device asked to reset before the transfer; the next power-up
    /// starts it.
    pub reset_pending: bool,
}

impl FirmwareSession {
    /// # Errors
    ///
    /// Returns `InvalidParameter` for an empty image or one above
    /// [`MAX_BLOCKS`] blocks.
    pub fn new(image: Bytes) -> Result<Self> {
        if image.is_empty() {
            return Err(RtlsError::InvalidParameter("firmware image is empty".into()));
        }
        let blocks = image.len().div_ceil(BLOCK_SIZE);
        if blocks > MAX_BLOCKS {
            return Err(RtlsError::InvalidParameter(format!(
                "firmware image needs {} blocks, maximum is {}",
                blocks, MAX_BLOCKS
            )));
        }

        Ok(Self {
            image,
            total_blocks: blocks as u16,
            index: 0,
            retries: 0,
            finished: false,
            reset_pending: false,
        })
    }

    pub fn total_blocks(&self) -> u16 {
        self.total_blocks
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn enter_request(&self) -> EnterUpgradeRequest {
        EnterUpgradeRequest {
            total_blocks: self.total_blocks,
            image_length: self.image.len() as u32,
        }
    }

    /// The block at the current index.
    pub fn current_block(&self) -> BlockWrite {
        self.block(self.index)
    }

    fn block(&self, index: u16) -> BlockWrite {
        let start = index as usize * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(self.image.len());

        let data = if end - start == BLOCK_SIZE {
            self.image.slice(start..end)
        } else {
            let mut padded = self.image[start..end].to_vec();
            padded.resize(BLOCK_SIZE, PADDING);
            Bytes::from(padded)
        };

        BlockWrite {
            block_index: index,
            total_blocks: self.total_blocks,
            data,
        }
    }

    fn percent(&self) -> u8 {
        (100 * self.index as u32 / self.total_blocks as u32) as u8
    }

    /// Advance the transfer on a block acknowledgement.
    pub fn on_block_ack(&mut self, ack: &BlockAck) -> BlockStep {
        if self.finished {
            return BlockStep::Ignored;
        }

        match ack.error {
            ErrorCode::WriteInfoOk => {
                self.finished = true;
                BlockStep::Succeeded
            }
            ErrorCode::NoError => {
                if ack.block_index != self.index {
                    tracing::debug!(
                        expected = self.index,
                        acked = ack.block_index,
                        "Block ack index mismatch"
                    );
                }
                if self.index < self.total_blocks {
                    self.index += 1;
                }
                if self.index < self.total_blocks {
                    BlockStep::Send {
                        block: self.current_block(),
                        percent: self.percent(),
                    }
                } else {
                    BlockStep::AwaitCommit
                }
            }
            error => {
                self.retries += 1;
                if self.retries >= MAX_RETRIES {
                    self.finished = true;
                    return BlockStep::Failed {
                        percent: self.percent(),
                        error,
                    };
                }
                self.index = self.index.min(self.total_blocks - 1) / ROLLBACK_DIVISOR;
                BlockStep::Retry {
                    block: self.current_block(),
                    retries: self.retries,
                }
            }
        }
    }
}
