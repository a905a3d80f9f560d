//! The per-generation hardware model: which asynchronous events exist,
//! which counter each one decrements on completion, and how far each
//! counter can count.

use std::fmt;

use crate::ir::GfxLevel;
use crate::wait_imm::{WaitImm, WaitType, NUM_WAIT_TYPES};

pub const EVENT_SMEM: u32 = 1 << 0;
pub const EVENT_LDS: u32 = 1 << 1;
pub const EVENT_GDS: u32 = 1 << 2;
pub const EVENT_VMEM: u32 = 1 << 3;
/// Vector stores; only distinguished from loads on GFX10+.
pub const EVENT_VMEM_STORE: u32 = 1 << 4;
pub const EVENT_EXP_POS: u32 = 1 << 5;
pub const EVENT_EXP_PARAM: u32 = 1 << 6;
pub const EVENT_EXP_MRT_NULL: u32 = 1 << 7;
pub const EVENT_EXP_PRIM: u32 = 1 << 8;
pub const EVENT_EXP_DUAL_SRC_BLEND: u32 = 1 << 9;
pub const EVENT_GDS_GPR_LOCK: u32 = 1 << 10;
pub const EVENT_VMEM_GPR_LOCK: u32 = 1 << 11;
pub const EVENT_SENDMSG: u32 = 1 << 12;
pub const EVENT_SENDMSG_RTN: u32 = 1 << 13;
pub const EVENT_LDSDIR: u32 = 1 << 14;
pub const EVENT_VMEM_SAMPLE: u32 = 1 << 15;
pub const EVENT_VMEM_BVH: u32 = 1 << 16;
pub const NUM_EVENTS: usize = 17;

pub const EVENTS_EXP: u32 = EVENT_EXP_POS
  | EVENT_EXP_PARAM
  | EVENT_EXP_MRT_NULL
  | EVENT_EXP_PRIM
  | EVENT_EXP_DUAL_SRC_BLEND;

const EVENT_NAMES: [&str; NUM_EVENTS] = [
  "smem",
  "lds",
  "gds",
  "vmem",
  "vmem_store",
  "exp_pos",
  "exp_param",
  "exp_mrt_null",
  "exp_prim",
  "exp_dual_src_blend",
  "gds_gpr_lock",
  "vmem_gpr_lock",
  "sendmsg",
  "sendmsg_rtn",
  "ldsdir",
  "vmem_sample",
  "vmem_bvh",
];

/// Wrapper to print an event set by name.
pub struct Events(pub u32);

impl fmt::Debug for Events {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    write!(fmt, "{{")?;
    for (i, name) in EVENT_NAMES.iter().enumerate() {
      if self.0 & (1 << i) != 0 {
        write!(fmt, "{}{}", if first { "" } else { "|" }, name)?;
        first = false;
      }
    }
    write!(fmt, "}}")
  }
}

#[derive(Clone, Debug)]
pub struct TargetInfo {
  pub gfx_level: GfxLevel,
  /// The highest count each counter tracks before it saturates.
  pub max_cnt: WaitImm,
  /// The events decrementing each counter.
  pub events: [u32; NUM_WAIT_TYPES],
  /// Events that may complete out of issue order.
  pub unordered_events: u32,
  counters: [u8; NUM_EVENTS],
}

impl TargetInfo {
  pub fn new(gfx_level: GfxLevel) -> TargetInfo {
    let mut max_cnt = WaitImm::max(gfx_level);
    for &ty in &WaitType::ALL {
      max_cnt[ty] = max_cnt[ty].saturating_sub(1);
    }

    let mut events = [0u32; NUM_WAIT_TYPES];
    events[WaitType::Exp.index()] =
      EVENTS_EXP | EVENT_GDS_GPR_LOCK | EVENT_VMEM_GPR_LOCK | EVENT_LDSDIR;
    events[WaitType::Lgkm.index()] =
      EVENT_SMEM | EVENT_LDS | EVENT_GDS | EVENT_SENDMSG | EVENT_SENDMSG_RTN;
    events[WaitType::Vm.index()] = EVENT_VMEM;
    events[WaitType::Vs.index()] = EVENT_VMEM_STORE;
    if gfx_level >= GfxLevel::Gfx12 {
      events[WaitType::Sample.index()] = EVENT_VMEM_SAMPLE;
      events[WaitType::Bvh.index()] = EVENT_VMEM_BVH;
      events[WaitType::Km.index()] =
        EVENT_SMEM | EVENT_SENDMSG | EVENT_SENDMSG_RTN;
      events[WaitType::Lgkm.index()] &= !events[WaitType::Km.index()];
    }

    let mut counters = [0u8; NUM_EVENTS];
    for (i, counter_set) in counters.iter_mut().enumerate() {
      for &ty in &WaitType::ALL {
        if events[ty.index()] & (1 << i) != 0 {
          *counter_set |= ty.bit();
        }
      }
    }

    TargetInfo {
      gfx_level,
      max_cnt,
      events,
      unordered_events: EVENT_SMEM,
      counters,
    }
  }

  /// The events decrementing counter `ty`.
  pub fn events_of(&self, ty: WaitType) -> u32 {
    self.events[ty.index()]
  }

  /// The counters decremented by a single event.
  pub fn counters_for_event(&self, event: u32) -> u8 {
    debug_assert!(event.count_ones() == 1);
    self.counters[event.trailing_zeros() as usize]
  }

  /// The counters decremented by any event in a set.
  pub fn counters_for_events(&self, events: u32) -> u8 {
    let mut counters = 0;
    let mut rest = events;
    while rest != 0 {
      let i = rest.trailing_zeros();
      counters |= self.counters[i as usize];
      rest &= rest - 1;
    }
    counters
  }

  /// The first counter decremented by `event`.
  pub fn counter_of(&self, event: u32) -> WaitType {
    let counters = self.counters_for_event(event);
    assert!(counters != 0, "event {:?} has no counter", Events(event));
    WaitType::from_index(counters.trailing_zeros() as usize)
  }

  pub fn is_unordered(&self, events: u32) -> bool {
    events & self.unordered_events != 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lgkm_and_km_split_on_gfx12() {
    let gfx10 = TargetInfo::new(GfxLevel::Gfx10);
    assert_eq!(gfx10.counters_for_event(EVENT_SMEM), WaitType::Lgkm.bit());
    assert_eq!(gfx10.counters_for_event(EVENT_VMEM_STORE), WaitType::Vs.bit());
    assert_eq!(gfx10.max_cnt[WaitType::Vm], 62);
    assert_eq!(gfx10.max_cnt[WaitType::Km], 0);

    let gfx12 = TargetInfo::new(GfxLevel::Gfx12);
    assert_eq!(gfx12.counters_for_event(EVENT_SMEM), WaitType::Km.bit());
    assert_eq!(gfx12.counters_for_event(EVENT_LDS), WaitType::Lgkm.bit());
    assert_eq!(gfx12.counter_of(EVENT_VMEM_BVH), WaitType::Bvh);
    assert_eq!(gfx12.max_cnt[WaitType::Km], 30);
    assert_eq!(gfx10.max_cnt[WaitType::Sample], 0);
  }

  #[test]
  fn every_event_has_a_counter() {
    for &gfx in &GfxLevel::ALL {
      let info = TargetInfo::new(gfx);
      for i in 0..NUM_EVENTS {
        let event = 1 << i;
        if gfx < GfxLevel::Gfx12
          && event & (EVENT_VMEM_SAMPLE | EVENT_VMEM_BVH) != 0
        {
          continue;
        }
        assert_ne!(info.counters_for_event(1 << i), 0, "{:?}", Events(1 << i));
      }
    }
  }

  #[test]
  fn only_scalar_loads_are_unordered() {
    let info = TargetInfo::new(GfxLevel::Gfx9);
    assert!(info.is_unordered(EVENT_SMEM | EVENT_LDS));
    assert!(!info.is_unordered(EVENT_LDS | EVENT_VMEM));
    assert_eq!(
      info.counters_for_events(EVENT_LDS | EVENT_VMEM | EVENT_EXP_POS),
      WaitType::Lgkm.bit() | WaitType::Vm.bit() | WaitType::Exp.bit()
    );
  }
}
