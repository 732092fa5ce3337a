//! Address Model
//!
//! Three address spaces meet in the allocator:
//!
//! ```text
//!   volume RBA ──(block map)──▶ VirtualBlkAddr { vsid, offset }
//!                                      │
//!                               (stripe map)
//!                                      ▼
//!                 StripeAddr { WriteBufferArea, wb_lsid }   while buffered
//!                 StripeAddr { UserArea,        user_lsid } once flushed
//! ```
//!
//! Every allocated stripe gets `vsid == user_lsid`, so the owning segment of a
//! virtual stripe is `vsid / stripes_per_segment`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::GeometryConfig;
use crate::error::{Error, Result};

/// Stripe identifier (vsid, write buffer LSID or user-area LSID)
pub type StripeId = u32;

/// Segment identifier
pub type SegmentId = u32;

/// Volume identifier
pub type VolumeId = u32;

/// Logical block address inside a volume
pub type Rba = u64;

/// Sentinel stripe id meaning "no stripe"
pub const UNMAP_STRIPE: StripeId = u32::MAX;

/// Sentinel block offset meaning "no block"
pub const UNMAP_OFFSET: u32 = u32::MAX;

/// Reverse-map value for a block that carries no user data
pub const INVALID_RBA: Rba = u64::MAX;

/// Sentinel segment id
pub const UNMAP_SEGMENT: SegmentId = u32::MAX;

// =============================================================================
// Virtual Addresses
// =============================================================================

/// A block position in the volume-independent virtual stripe space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualBlkAddr {
    pub stripe_id: StripeId,
    pub offset: u32,
}

impl VirtualBlkAddr {
    /// The "no block" address.
    pub const UNMAP: VirtualBlkAddr = VirtualBlkAddr {
        stripe_id: UNMAP_STRIPE,
        offset: UNMAP_OFFSET,
    };

    pub fn new(stripe_id: StripeId, offset: u32) -> Self {
        Self { stripe_id, offset }
    }

    pub fn is_unmap(&self) -> bool {
        self.stripe_id == UNMAP_STRIPE
    }

    /// `None` for the unmapped sentinel.
    pub fn mapped(self) -> Option<Self> {
        if self.is_unmap() {
            None
        } else {
            Some(self)
        }
    }

    /// Address `n` blocks further into the same stripe.
    pub fn advance(self, n: u32) -> Self {
        Self {
            stripe_id: self.stripe_id,
            offset: self.offset + n,
        }
    }
}

impl fmt::Display for VirtualBlkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unmap() {
            write!(f, "vsa(unmap)")
        } else {
            write!(f, "vsa({}:{})", self.stripe_id, self.offset)
        }
    }
}

/// A contiguous run of virtual blocks inside a single stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBlks {
    pub start_vsa: VirtualBlkAddr,
    pub num_blks: u32,
}

impl VirtualBlks {
    /// The zero-length sentinel run.
    pub const UNMAP: VirtualBlks = VirtualBlks {
        start_vsa: VirtualBlkAddr::UNMAP,
        num_blks: 0,
    };

    pub fn new(start_vsa: VirtualBlkAddr, num_blks: u32) -> Self {
        Self {
            start_vsa,
            num_blks,
        }
    }

    pub fn is_unmap(&self) -> bool {
        self.start_vsa.is_unmap() || self.num_blks == 0
    }

    /// Iterate the individual block addresses.
    pub fn iter(&self) -> impl Iterator<Item = VirtualBlkAddr> + '_ {
        (0..self.num_blks).map(move |i| self.start_vsa.advance(i))
    }
}

// =============================================================================
// Physical Stripe Location
// =============================================================================

/// Where a virtual stripe currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StripeLoc {
    /// Resident in the in-memory write buffer
    WriteBufferArea,
    /// Committed to SSD
    UserArea,
}

impl fmt::Display for StripeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StripeLoc::WriteBufferArea => write!(f, "WriteBuffer"),
            StripeLoc::UserArea => write!(f, "UserArea"),
        }
    }
}

/// Physical stripe address: an area plus an LSID inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripeAddr {
    pub loc: StripeLoc,
    pub id: StripeId,
}

impl StripeAddr {
    pub fn write_buffer(id: StripeId) -> Self {
        Self {
            loc: StripeLoc::WriteBufferArea,
            id,
        }
    }

    pub fn user_area(id: StripeId) -> Self {
        Self {
            loc: StripeLoc::UserArea,
            id,
        }
    }

    pub fn is_in_write_buffer_area(&self) -> bool {
        self.loc == StripeLoc::WriteBufferArea
    }

    pub fn is_in_user_data_area(&self) -> bool {
        self.loc == StripeLoc::UserArea
    }
}

impl fmt::Display for StripeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.loc, self.id)
    }
}

/// One reverse map slot: which logical block a physical block backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseMapEntry {
    pub rba: Rba,
    pub volume_id: VolumeId,
}

impl ReverseMapEntry {
    pub const INVALID: ReverseMapEntry = ReverseMapEntry {
        rba: INVALID_RBA,
        volume_id: u32::MAX,
    };

    pub fn new(rba: Rba, volume_id: VolumeId) -> Self {
        Self { rba, volume_id }
    }

    pub fn is_valid(&self) -> bool {
        self.rba != INVALID_RBA
    }
}

// =============================================================================
// Address Info
// =============================================================================

/// Static geometry shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfo {
    block_size: usize,
    blks_per_stripe: u32,
    stripes_per_segment: u32,
    num_user_segments: u32,
    num_wb_stripes: u32,
    max_volumes: u32,
}

impl AddressInfo {
    /// Build from validated geometry.
    pub fn new(geometry: &GeometryConfig) -> Result<Self> {
        geometry.validate()?;
        Ok(Self {
            block_size: geometry.block_size,
            blks_per_stripe: geometry.blks_per_stripe,
            stripes_per_segment: geometry.stripes_per_segment,
            num_user_segments: geometry.num_segments,
            num_wb_stripes: geometry.num_wb_stripes,
            max_volumes: geometry.max_volumes,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blks_per_stripe(&self) -> u32 {
        self.blks_per_stripe
    }

    pub fn stripes_per_segment(&self) -> u32 {
        self.stripes_per_segment
    }

    pub fn num_user_segments(&self) -> u32 {
        self.num_user_segments
    }

    pub fn num_user_stripes(&self) -> u32 {
        self.num_user_segments * self.stripes_per_segment
    }

    pub fn num_wb_stripes(&self) -> u32 {
        self.num_wb_stripes
    }

    pub fn max_volumes(&self) -> u32 {
        self.max_volumes
    }

    /// Blocks in one segment (valid-count ceiling).
    pub fn blks_per_segment(&self) -> u32 {
        self.blks_per_stripe * self.stripes_per_segment
    }

    /// Bytes in one stripe buffer.
    pub fn stripe_bytes(&self) -> usize {
        self.block_size * self.blks_per_stripe as usize
    }

    /// Segment owning a user-area stripe.
    pub fn segment_of(&self, user_lsid: StripeId) -> SegmentId {
        user_lsid / self.stripes_per_segment
    }

    /// First user-area stripe of a segment.
    pub fn first_stripe_of(&self, segment_id: SegmentId) -> StripeId {
        segment_id * self.stripes_per_segment
    }

    /// Whether `user_lsid` is the first stripe of its segment.
    pub fn is_segment_boundary(&self, user_lsid: StripeId) -> bool {
        user_lsid % self.stripes_per_segment == 0
    }

    /// Reject volume ids outside the array.
    pub fn check_volume(&self, volume_id: VolumeId) -> Result<()> {
        if volume_id >= self.max_volumes {
            return Err(Error::VolumeOutOfRange {
                volume_id,
                max_volumes: self.max_volumes,
            });
        }
        Ok(())
    }
}
