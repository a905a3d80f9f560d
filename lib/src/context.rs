//! The dataflow state carried across block boundaries: one `WaitEntry` per
//! register unit with an outstanding asynchronous access, plus the deferred
//! barrier bookkeeping.

use rustc_hash::FxHashMap;
use std::fmt;

use crate::ir::{PhysReg, SyncScope, STORAGE_COUNT, STORAGE_NAMES};
use crate::target::{Events, EVENT_VMEM};
use crate::wait_imm::{WaitImm, WaitType};

pub type Map<K, V> = FxHashMap<K, V>;

//=============================================================================
// WaitEntry

/// The outstanding asynchronous accesses to one register unit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WaitEntry {
  /// Per counter, the target that guarantees every tracked access retired.
  pub imm: WaitImm,
  pub events: u32,
  /// The subset of `events` that may touch the lanes active on the current
  /// logical path.
  pub logical_events: u32,
  pub counters: u8,
  /// Set for pending writes of the register, which also block reads.
  /// Pending reads (exports, GDS operand locks) only block writes.
  pub wait_on_read: bool,
  pub vmem_types: u8,
  /// Which 16-bit halves of the unit the pending vector-memory load writes.
  pub vm_mask: u8,
}

impl WaitEntry {
  pub fn new(event: u32, imm: WaitImm, counters: u8, wait_on_read: bool) -> Self {
    WaitEntry {
      imm,
      events: event,
      logical_events: event,
      counters,
      wait_on_read,
      vmem_types: 0,
      vm_mask: 0,
    }
  }

  /// Merges `other` into `self`.  `logical_events` is left alone; the
  /// context join decides how it flows.
  pub fn join(&mut self, other: &WaitEntry) -> bool {
    let mut changed = (other.events & !self.events) != 0
      || (other.counters & !self.counters) != 0
      || (other.wait_on_read && !self.wait_on_read)
      || (other.vmem_types & !self.vmem_types) != 0
      || (other.vm_mask & !self.vm_mask) != 0;
    self.events |= other.events;
    self.counters |= other.counters;
    changed |= self.imm.combine(&other.imm);
    self.wait_on_read |= other.wait_on_read;
    self.vmem_types |= other.vmem_types;
    self.vm_mask |= other.vm_mask;
    changed
  }

  /// Forgets everything tracked by counter `ty`, whose events are
  /// `type_events`.
  pub fn remove_wait(&mut self, ty: WaitType, type_events: u32) {
    self.counters &= !ty.bit();
    self.imm.unset(ty);
    self.events &= !type_events;
    self.logical_events &= self.events;
    if ty == WaitType::Vm {
      self.vmem_types = 0;
    }
    if type_events & EVENT_VMEM != 0 {
      self.vm_mask = 0;
    }
  }
}

impl fmt::Debug for WaitEntry {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?} events={:?}", self.imm, Events(self.events))?;
    if self.logical_events != self.events {
      write!(fmt, " logical={:?}", Events(self.logical_events))?;
    }
    if !self.wait_on_read {
      write!(fmt, " write-only")?;
    }
    if self.vmem_types != 0 {
      write!(fmt, " vmem_types={:#x}", self.vmem_types)?;
    }
    if self.vm_mask != 0 {
      write!(fmt, " vm_mask={:#x}", self.vm_mask)?;
    }
    Ok(())
  }
}

//=============================================================================
// Barrier bookkeeping

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierKind {
  /// Waits for all non-private accesses and all scratch/vgpr-spill
  /// accesses.
  ReleaseDep = 0,
  /// Waits for all atomics.
  AcquireDep = 1,
  /// Paid at the next atomic, control barrier, GS-done message or
  /// position/primitive export.
  Release = 2,
  /// Paid at the next non-private access.
  Acquire = 3,
}

pub const NUM_BARRIER_KINDS: usize = 4;

impl BarrierKind {
  pub fn bit(self) -> u8 {
    1 << (self as u8)
  }
}

/// Per storage class, the wait needed to complete the accesses a barrier
/// depends on.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BarrierState {
  pub imm: [WaitImm; STORAGE_COUNT],
  pub events: [u32; STORAGE_COUNT],
  pub scope: [SyncScope; STORAGE_COUNT],
  pub storage: u16,
}

impl BarrierState {
  pub fn new() -> Self {
    BarrierState {
      imm: [WaitImm::new(); STORAGE_COUNT],
      events: [0; STORAGE_COUNT],
      scope: [SyncScope::Invocation; STORAGE_COUNT],
      storage: 0,
    }
  }

  pub fn join(&mut self, other: &BarrierState) -> bool {
    let mut changed = false;
    for i in 0..STORAGE_COUNT {
      changed |= self.imm[i].combine(&other.imm[i]);
      changed |= (other.events[i] & !self.events[i]) != 0;
      self.events[i] |= other.events[i];
      if other.scope[i] > self.scope[i] {
        self.scope[i] = other.scope[i];
        changed = true;
      }
    }
    self.storage |= other.storage;
    changed
  }
}

impl Default for BarrierState {
  fn default() -> Self {
    BarrierState::new()
  }
}

impl fmt::Debug for BarrierState {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut list = fmt.debug_map();
    for i in 0..STORAGE_COUNT {
      if self.storage & (1 << i) != 0 {
        list.entry(
          &STORAGE_NAMES[i],
          &format_args!(
            "{:?} {:?} {}",
            self.imm[i],
            Events(self.events[i]),
            self.scope[i].name()
          ),
        );
      }
    }
    list.finish()
  }
}

//=============================================================================
// WaitCtx

#[derive(Clone, PartialEq, Eq)]
pub struct WaitCtx {
  /// Counters that may currently be nonzero.
  pub nonzero: u8,
  /// A flat access that may have hit LDS is outstanding; its counters can
  /// no longer be trusted to order anything, so only full drains help.
  pub pending_flat_lgkm: bool,
  pub pending_flat_vm: bool,
  pub bar: [BarrierState; NUM_BARRIER_KINDS],
  pub bar_nonempty: u8,
  pub gpr_map: Map<PhysReg, WaitEntry>,
}

impl WaitCtx {
  pub fn new() -> Self {
    WaitCtx {
      nonzero: 0,
      pending_flat_lgkm: false,
      pending_flat_vm: false,
      bar: [BarrierState::new(); NUM_BARRIER_KINDS],
      bar_nonempty: 0,
      gpr_map: Map::default(),
    }
  }

  pub fn bar(&self, kind: BarrierKind) -> &BarrierState {
    &self.bar[kind as usize]
  }

  pub fn bar_mut(&mut self, kind: BarrierKind) -> &mut BarrierState {
    &mut self.bar[kind as usize]
  }

  /// Joins the outgoing context of a predecessor into this one and returns
  /// whether anything changed.
  ///
  /// Linear predecessors (`logical == false`) contribute register entries;
  /// logical predecessors contribute the lanes those entries may touch and
  /// the barrier state.  When the block is a divergent merge
  /// (`logical_merge`), the entries are taken from the logical
  /// predecessors instead, since a counter may have been waited on along
  /// every logical path but not along the linear one.
  pub fn join(&mut self, other: &WaitCtx, logical: bool, logical_merge: bool) -> bool {
    let mut changed = (other.pending_flat_lgkm && !self.pending_flat_lgkm)
      || (other.pending_flat_vm && !self.pending_flat_vm)
      || (other.nonzero & !self.nonzero) != 0;

    self.nonzero |= other.nonzero;
    self.pending_flat_lgkm |= other.pending_flat_lgkm;
    self.pending_flat_vm |= other.pending_flat_vm;

    if logical == logical_merge {
      for (reg, entry) in &other.gpr_map {
        match self.gpr_map.get_mut(reg) {
          Some(existing) => changed |= existing.join(entry),
          None => {
            let mut new_entry = *entry;
            new_entry.logical_events = 0;
            self.gpr_map.insert(*reg, new_entry);
            changed = true;
          }
        }
      }
    }

    if logical {
      for (reg, entry) in &other.gpr_map {
        if let Some(existing) = self.gpr_map.get_mut(reg) {
          changed |= (entry.logical_events & !existing.logical_events) != 0;
          existing.logical_events |= entry.logical_events;
        }
      }

      for i in 0..NUM_BARRIER_KINDS {
        if other.bar_nonempty & (1 << i) != 0 {
          changed |= self.bar[i].join(&other.bar[i]);
        }
      }
      self.bar_nonempty |= other.bar_nonempty;
    }

    changed
  }
}

impl Default for WaitCtx {
  fn default() -> Self {
    WaitCtx::new()
  }
}

impl fmt::Debug for WaitCtx {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    writeln!(
      fmt,
      "nonzero={:#x} pending_flat_lgkm={} pending_flat_vm={}",
      self.nonzero, self.pending_flat_lgkm, self.pending_flat_vm
    )?;
    let mut regs: Vec<_> = self.gpr_map.iter().collect();
    regs.sort_by_key(|(reg, _)| **reg);
    for (reg, entry) in regs {
      writeln!(fmt, "  {:?}: {:?}", reg, entry)?;
    }
    for i in 0..NUM_BARRIER_KINDS {
      if self.bar_nonempty & (1 << i) != 0 {
        writeln!(fmt, "  bar[{}]: {:?}", i, self.bar[i])?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ir::{STORAGE_BUFFER, VMEM_NOSAMPLER};
  use crate::target::{EVENT_LDS, EVENT_SMEM};

  fn vmem_entry() -> WaitEntry {
    let mut entry =
      WaitEntry::new(EVENT_VMEM, WaitImm::single(WaitType::Vm, 0), WaitType::Vm.bit(), true);
    entry.vmem_types = VMEM_NOSAMPLER;
    entry.vm_mask = 0x3;
    entry
  }

  fn sample_ctx() -> WaitCtx {
    let mut ctx = WaitCtx::new();
    ctx.nonzero = WaitType::Vm.bit() | WaitType::Lgkm.bit();
    ctx.gpr_map.insert(PhysReg::vgpr(0), vmem_entry());
    ctx.gpr_map.insert(
      PhysReg::sgpr(4),
      WaitEntry::new(EVENT_SMEM, WaitImm::single(WaitType::Lgkm, 0), WaitType::Lgkm.bit(), true),
    );
    let bar = ctx.bar_mut(BarrierKind::ReleaseDep);
    bar.storage = STORAGE_BUFFER;
    bar.imm[0] = WaitImm::single(WaitType::Vm, 0);
    bar.events[0] = EVENT_VMEM;
    ctx.bar_nonempty = BarrierKind::ReleaseDep.bit();
    ctx
  }

  #[test]
  fn entry_join_reports_changes() {
    let mut a = vmem_entry();
    assert!(!a.join(&vmem_entry()));
    let mut lds =
      WaitEntry::new(EVENT_LDS, WaitImm::single(WaitType::Lgkm, 2), WaitType::Lgkm.bit(), true);
    assert!(a.join(&lds));
    assert_eq!(a.events, EVENT_VMEM | EVENT_LDS);
    assert_eq!(a.imm[WaitType::Lgkm], 2);
    // Logical events do not flow through an entry join.
    assert_eq!(a.logical_events, EVENT_VMEM);
    lds.imm[WaitType::Lgkm] = 3;
    assert!(!a.join(&lds));
  }

  #[test]
  fn remove_wait_clears_vm_state() {
    let mut a = vmem_entry();
    a.join(&WaitEntry::new(
      EVENT_LDS,
      WaitImm::single(WaitType::Lgkm, 0),
      WaitType::Lgkm.bit(),
      true,
    ));
    a.remove_wait(WaitType::Vm, EVENT_VMEM);
    assert_eq!(a.counters, WaitType::Lgkm.bit());
    assert_eq!(a.events, EVENT_LDS);
    assert_eq!(a.logical_events, 0);
    assert_eq!(a.vmem_types, 0);
    assert_eq!(a.vm_mask, 0);
    assert!(!a.imm.is_set(WaitType::Vm));
  }

  #[test]
  fn join_is_idempotent() {
    let a = sample_ctx();
    for &(logical, merge) in &[(false, false), (true, false), (true, true), (false, true)] {
      let mut b = a.clone();
      assert!(!b.join(&a, logical, merge));
      assert_eq!(b, a);
    }
  }

  #[test]
  fn linear_join_starts_without_lanes() {
    let mut ctx = WaitCtx::new();
    assert!(ctx.join(&sample_ctx(), false, false));
    assert_eq!(ctx.gpr_map[&PhysReg::vgpr(0)].logical_events, 0);
    // Barrier state only flows along logical edges.
    assert_eq!(ctx.bar_nonempty, 0);

    assert!(ctx.join(&sample_ctx(), true, false));
    assert_eq!(ctx.gpr_map[&PhysReg::vgpr(0)].logical_events, EVENT_VMEM);
    assert_eq!(ctx.bar_nonempty, BarrierKind::ReleaseDep.bit());
    assert_eq!(ctx, sample_ctx());
  }

  #[test]
  fn logical_merge_takes_entries_from_logical_preds() {
    let mut ctx = WaitCtx::new();
    // A linear-only predecessor contributes nothing to a divergent merge.
    assert!(ctx.join(&sample_ctx(), false, true));
    assert!(ctx.gpr_map.is_empty());
    assert!(ctx.join(&sample_ctx(), true, true));
    assert_eq!(ctx.gpr_map.len(), 2);
  }

  #[test]
  fn join_order_does_not_matter() {
    let a = sample_ctx();
    let mut b = WaitCtx::new();
    b.gpr_map.insert(PhysReg::vgpr(0), {
      let mut e = vmem_entry();
      e.imm[WaitType::Vm] = 3;
      e
    });
    b.gpr_map.insert(PhysReg::vgpr(7), vmem_entry());
    b.nonzero = WaitType::Vm.bit();

    let mut ab = WaitCtx::new();
    ab.join(&a, false, false);
    ab.join(&b, false, false);
    ab.join(&a, true, false);
    ab.join(&b, true, false);
    let mut ba = WaitCtx::new();
    ba.join(&b, false, false);
    ba.join(&a, false, false);
    ba.join(&b, true, false);
    ba.join(&a, true, false);
    assert_eq!(ab, ba);
    assert_eq!(ab.gpr_map[&PhysReg::vgpr(0)].imm[WaitType::Vm], 0);
  }
}
