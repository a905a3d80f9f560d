//! Wait immediates: the operand of `s_waitcnt` and `s_waitcnt_depctr`.
//!
//! A `WaitImm` holds one target per hardware counter.  The hardware stalls
//! until every counter with a target has dropped to (or below) that target.
//! A slot that is `WaitImm::UNSET` does not constrain its counter.

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

use crate::ir::GfxLevel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WaitType {
  Exp = 0,
  Lgkm = 1,
  Vm = 2,
  Vs = 3,
  Sample = 4,
  Bvh = 5,
  Km = 6,
}

pub const NUM_WAIT_TYPES: usize = 7;

impl WaitType {
  pub const ALL: [WaitType; NUM_WAIT_TYPES] = [
    WaitType::Exp,
    WaitType::Lgkm,
    WaitType::Vm,
    WaitType::Vs,
    WaitType::Sample,
    WaitType::Bvh,
    WaitType::Km,
  ];

  pub fn from_index(index: usize) -> WaitType {
    WaitType::ALL[index]
  }

  pub fn index(self) -> usize {
    self as usize
  }

  /// The bit of this counter in a counter set.
  pub fn bit(self) -> u8 {
    1 << (self as u8)
  }

  pub fn name(self) -> &'static str {
    match self {
      WaitType::Exp => "exp",
      WaitType::Lgkm => "lgkm",
      WaitType::Vm => "vm",
      WaitType::Vs => "vs",
      WaitType::Sample => "sample",
      WaitType::Bvh => "bvh",
      WaitType::Km => "km",
    }
  }

  pub fn from_name(name: &str) -> Option<WaitType> {
    WaitType::ALL.iter().copied().find(|t| t.name() == name)
  }
}

/// Iterates over the counters in a counter set.
pub fn counters_in(counters: u8) -> impl Iterator<Item = WaitType> {
  WaitType::ALL.iter().copied().filter(move |t| counters & t.bit() != 0)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct WaitImm {
  slots: [u16; NUM_WAIT_TYPES],
}

impl WaitImm {
  pub const UNSET: u16 = 0xffff;

  pub fn new() -> WaitImm {
    WaitImm { slots: [WaitImm::UNSET; NUM_WAIT_TYPES] }
  }

  /// A wait for a single counter.
  pub fn single(ty: WaitType, value: u16) -> WaitImm {
    let mut imm = WaitImm::new();
    imm[ty] = value;
    imm
  }

  /// Waits for every counter in `counters` to drain completely.
  pub fn zero(counters: u8) -> WaitImm {
    let mut imm = WaitImm::new();
    for ty in counters_in(counters) {
      imm[ty] = 0;
    }
    imm
  }

  /// Per-slot minimum.  Returns whether any slot changed.
  pub fn combine(&mut self, other: &WaitImm) -> bool {
    let mut changed = false;
    for (slot, &value) in self.slots.iter_mut().zip(other.slots.iter()) {
      if value < *slot {
        *slot = value;
        changed = true;
      }
    }
    changed
  }

  pub fn is_empty(&self) -> bool {
    self.slots.iter().all(|&slot| slot == WaitImm::UNSET)
  }

  pub fn is_set(&self, ty: WaitType) -> bool {
    self[ty] != WaitImm::UNSET
  }

  pub fn unset(&mut self, ty: WaitType) {
    self[ty] = WaitImm::UNSET;
  }

  /// The largest encodable target of each counter; zero where the counter
  /// does not exist on `gfx_level`.
  pub fn max(gfx_level: GfxLevel) -> WaitImm {
    let mut imm = WaitImm::new();
    imm[WaitType::Vm] = if gfx_level >= GfxLevel::Gfx9 { 63 } else { 15 };
    imm[WaitType::Exp] = 7;
    imm[WaitType::Lgkm] = if gfx_level >= GfxLevel::Gfx10 { 63 } else { 15 };
    imm[WaitType::Vs] = if gfx_level >= GfxLevel::Gfx10 { 63 } else { 0 };
    let gfx12 = gfx_level >= GfxLevel::Gfx12;
    imm[WaitType::Sample] = if gfx12 { 63 } else { 0 };
    imm[WaitType::Bvh] = if gfx12 { 7 } else { 0 };
    imm[WaitType::Km] = if gfx12 { 31 } else { 0 };
    imm
  }

  /// Slots that are set, with their targets.
  pub fn iter_set(&self) -> impl Iterator<Item = (WaitType, u16)> + '_ {
    WaitType::ALL
      .iter()
      .copied()
      .map(move |ty| (ty, self[ty]))
      .filter(|&(_, value)| value != WaitImm::UNSET)
  }
}

impl Default for WaitImm {
  fn default() -> Self {
    WaitImm::new()
  }
}

impl Index<WaitType> for WaitImm {
  type Output = u16;
  fn index(&self, ty: WaitType) -> &u16 {
    &self.slots[ty as usize]
  }
}

impl IndexMut<WaitType> for WaitImm {
  fn index_mut(&mut self, ty: WaitType) -> &mut u16 {
    &mut self.slots[ty as usize]
  }
}

impl fmt::Display for WaitImm {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (ty, value) in self.iter_set() {
      write!(fmt, "{}{}={}", if first { "" } else { " " }, ty.name(), value)?;
      first = false;
    }
    Ok(())
  }
}

impl fmt::Debug for WaitImm {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if self.is_empty() {
      write!(fmt, "{{}}")
    } else {
      write!(fmt, "{{{}}}", self)
    }
  }
}

//=============================================================================
// DepctrWait

/// Targets for the "dependency counters" of `s_waitcnt_depctr`.  Every
/// field at its maximum means no wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct DepctrWait {
  pub va_vdst: u8,
  pub va_sdst: u8,
  pub va_ssrc: u8,
  pub hold_cnt: u8,
  pub vm_vsrc: u8,
  pub va_vcc: u8,
  pub sa_sdst: u8,
}

// (name, shift, width) of each field in the packed immediate.
const DEPCTR_FIELDS: [(&str, u32, u32); 7] = [
  ("va_vdst", 12, 4),
  ("va_sdst", 9, 3),
  ("va_ssrc", 8, 1),
  ("hold_cnt", 7, 1),
  ("vm_vsrc", 2, 3),
  ("va_vcc", 1, 1),
  ("sa_sdst", 0, 1),
];

impl DepctrWait {
  pub fn new() -> DepctrWait {
    DepctrWait::unpack(0xffff)
  }

  fn fields(&self) -> [u8; 7] {
    [
      self.va_vdst,
      self.va_sdst,
      self.va_ssrc,
      self.hold_cnt,
      self.vm_vsrc,
      self.va_vcc,
      self.sa_sdst,
    ]
  }

  fn fields_mut(&mut self) -> [&mut u8; 7] {
    [
      &mut self.va_vdst,
      &mut self.va_sdst,
      &mut self.va_ssrc,
      &mut self.hold_cnt,
      &mut self.vm_vsrc,
      &mut self.va_vcc,
      &mut self.sa_sdst,
    ]
  }

  pub fn pack(&self) -> u16 {
    let mut packed = 0u16;
    for (value, (_, shift, width)) in self.fields().iter().zip(DEPCTR_FIELDS) {
      let mask = (1u16 << width) - 1;
      packed |= (*value as u16 & mask) << shift;
    }
    // Unused bits stay set.
    packed | 0x0060
  }

  pub fn unpack(imm: u16) -> DepctrWait {
    let mut wait = DepctrWait {
      va_vdst: 0,
      va_sdst: 0,
      va_ssrc: 0,
      hold_cnt: 0,
      vm_vsrc: 0,
      va_vcc: 0,
      sa_sdst: 0,
    };
    let fields = IntoIterator::into_iter(wait.fields_mut());
    for (field, (_, shift, width)) in fields.zip(DEPCTR_FIELDS) {
      *field = ((imm >> shift) & ((1 << width) - 1)) as u8;
    }
    wait
  }

  pub fn is_empty(&self) -> bool {
    *self == DepctrWait::new()
  }

  /// Field-wise minimum.  Returns whether any field changed.
  pub fn combine(&mut self, other: &DepctrWait) -> bool {
    let mut changed = false;
    let fields = IntoIterator::into_iter(self.fields_mut());
    for (field, value) in fields.zip(other.fields()) {
      if value < *field {
        *field = value;
        changed = true;
      }
    }
    changed
  }

  /// Sets a field by name, for parsers.  Returns false for unknown names or
  /// out-of-range values.
  pub fn set_field(&mut self, name: &str, value: u8) -> bool {
    let fields = IntoIterator::into_iter(self.fields_mut());
    for (field, (field_name, _, width)) in fields.zip(DEPCTR_FIELDS) {
      if field_name == name {
        if value as u32 >= 1 << width {
          return false;
        }
        *field = value;
        return true;
      }
    }
    false
  }
}

impl Default for DepctrWait {
  fn default() -> Self {
    DepctrWait::new()
  }
}

impl fmt::Display for DepctrWait {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (value, (name, _, width)) in self.fields().iter().zip(DEPCTR_FIELDS) {
      if (*value as u32) < (1 << width) - 1 {
        write!(fmt, "{}{}={}", if first { "" } else { " " }, name, value)?;
        first = false;
      }
    }
    Ok(())
  }
}
