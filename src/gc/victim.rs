//! Victim Stripe
//!
//! Decides which blocks of a victim stripe still carry live data. A block is
//! live only while every map agrees on it:
//!
//! ```text
//!   reverse map[offset] = (vol, rba)      rba is valid
//!   block map(vol)                        volume still exists
//!   block map(vol, rba) == (vsid, offset) not overwritten since
//!   stripe map(vsid) == UserArea:lsid     stripe really lives here
//! ```

use tracing::debug;

use crate::address::{Rba, StripeAddr, StripeId, VirtualBlkAddr, VolumeId};
use crate::domain::ports::{BlockMap, ReverseMapStore, StripeMap};
use crate::error::{Error, Result};

/// One live block of a victim stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidBlock {
    pub offset: u32,
    pub volume_id: VolumeId,
    pub rba: Rba,
}

impl ValidBlock {
    pub fn vsa(&self, vsid: StripeId) -> VirtualBlkAddr {
        VirtualBlkAddr::new(vsid, self.offset)
    }
}

#[derive(Debug, Clone)]
pub struct VictimStripe {
    lsid: StripeId,
    valid: Vec<ValidBlock>,
}

impl VictimStripe {
    /// Classify the blocks of user-area stripe `lsid`. A stripe the cursor
    /// skipped, or one that lives elsewhere, has no live blocks. A stripe
    /// that was published without a reverse map is an error.
    pub fn load(
        lsid: StripeId,
        stripe_map: &dyn StripeMap,
        block_map: &dyn BlockMap,
        reverse_maps: &dyn ReverseMapStore,
    ) -> Result<Self> {
        let vsid = lsid;
        if stripe_map.get_lsa(vsid) != Some(StripeAddr::user_area(lsid)) {
            debug!("Victim stripe {} is not resident, nothing to copy", lsid);
            return Ok(Self {
                lsid,
                valid: Vec::new(),
            });
        }

        let entries = reverse_maps
            .load(vsid)
            .ok_or(Error::ReverseMapMissing(vsid))?;

        let valid = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid())
            .filter(|(_, entry)| block_map.volume_size(entry.volume_id).is_some())
            .filter(|(offset, entry)| {
                block_map.get_vsa(entry.volume_id, entry.rba)
                    == VirtualBlkAddr::new(vsid, *offset as u32)
            })
            .map(|(offset, entry)| ValidBlock {
                offset: offset as u32,
                volume_id: entry.volume_id,
                rba: entry.rba,
            })
            .collect();

        Ok(Self { lsid, valid })
    }

    pub fn lsid(&self) -> StripeId {
        self.lsid
    }

    pub fn vsid(&self) -> StripeId {
        self.lsid
    }

    pub fn valid_blocks(&self) -> &[ValidBlock] {
        &self.valid
    }

    pub fn into_valid_blocks(self) -> Vec<ValidBlock> {
        self.valid
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }
}
