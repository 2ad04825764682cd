//! # Selected flag and session inventory flags
//!
//! The tag carries one SL flag and four inventoried flags, one per
//! session S0..S3. Select commands steer them; Query uses them to decide
//! round participation. Persistence is deliberately simple: everything
//! lives in RAM, SL and S0 ride through a power dip untouched, S1
//! survives only while an inventory round is in progress and S2/S3 come
//! back as A after every dip.

use crate::cmd::cmd_select::{SelectAction, SelectTarget};

/// Inventoried flag value of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InventoryFlag {
    A,
    B,
}

impl InventoryFlag {
    pub fn from_bit(bit: u8) -> Self {
        if bit == 0 { InventoryFlag::A } else { InventoryFlag::B }
    }

    fn negate(self) -> Self {
        match self {
            InventoryFlag::A => InventoryFlag::B,
            InventoryFlag::B => InventoryFlag::A,
        }
    }
}

pub struct Sessions {
    sl: bool,
    flags: [InventoryFlag; 4],
}

impl Sessions {
    /// Cold-boot state: SL deasserted, every inventoried flag A.
    pub fn new() -> Self {
        Sessions {
            sl: false,
            flags: [InventoryFlag::A; 4],
        }
    }

    pub fn sl(&self) -> bool {
        self.sl
    }

    pub fn flag(&self, session: u8) -> InventoryFlag {
        self.flags[(session & 3) as usize]
    }

    /// Re-initialization after a power dip with RAM retention. SL and S0
    /// persist; S1 persists only when the dip hit mid-round.
    pub fn power_cycled(&mut self, in_round: bool) {
        if !in_round {
            self.flags[1] = InventoryFlag::A;
        }
        self.flags[2] = InventoryFlag::A;
        self.flags[3] = InventoryFlag::A;
    }

    /// Inter-command timeout hook. Intentionally does nothing: refreshing
    /// S2/S3 here would clear them between every pair of commands, since
    /// the receive deadline expires whenever the reader pauses. The
    /// refresh runs on the power path instead.
    pub fn handle_timeout(&mut self) {}

    /// Apply a Select outcome to the targeted flag.
    pub fn apply_select(&mut self, target: SelectTarget, action: SelectAction, matched: bool) {
        use SelectAction::*;
        // (on match, on non-match); Some(true) = assert / A,
        // Some(false) = deassert / B, None twice = negate
        let op = match (action, matched) {
            (AssertElseDeassert, true) | (Assert, true) => Some(true),
            (AssertElseDeassert, false) | (ElseDeassert, false) => Some(false),
            (Assert, false) | (ElseDeassert, true) => return,
            (Negate, true) | (ElseNegate, false) => None,
            (Negate, false) | (ElseNegate, true) => return,
            (DeassertElseAssert, true) | (Deassert, true) => Some(false),
            (DeassertElseAssert, false) | (ElseAssert, false) => Some(true),
            (Deassert, false) | (ElseAssert, true) => return,
        };
        match target {
            SelectTarget::Sl => {
                self.sl = match op {
                    Some(assert) => assert,
                    None => !self.sl,
                };
            }
            SelectTarget::Session(s) => {
                let flag = &mut self.flags[(s & 3) as usize];
                *flag = match op {
                    Some(true) => InventoryFlag::A,
                    Some(false) => InventoryFlag::B,
                    None => flag.negate(),
                };
            }
            SelectTarget::Rfu => {}
        }
    }
}

impl Default for Sessions {
    fn default() -> Self {
        Self::new()
    }
}
