//! Barrier Policy
//!
//! Architecture-independent decisions. The `*Plan` types fix the static
//! shape of a barrier from its site and the configuration; the `*_path`
//! functions give the path a barrier takes for a concrete runtime state.
//! The emitters follow the plans, and the path functions are the reference
//! the generated code is checked against.
//!
//! ```text
//!   LRB            null? ─► done
//!                  gc_state & mask == 0 ─► done (result = input)
//!   strong:        mask = HAS_FORWARDED        ─► mid path: cset[obj] ? slow : done
//!   weak/phantom:  mask = HAS_FORWARDED|WEAK_ROOTS ─► slow
//!
//!   pre-write      gc_state & MARKING == 0 ─► done
//!                  prev == null ─► done
//!                  index == 0 ─► stub  else  buffer[index -= 8] = prev
//! ```

use crate::config::BarrierConfig;
use crate::gc_state::GcState;
use crate::site::{LoadBarrierSite, PreWriteSite, PreviousValue};
use crate::strength::ReferenceStrength;
use crate::stubs::StubKind;

/// Static shape of a load reference barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadBarrierPlan {
    pub strength: ReferenceStrength,
    /// GC-state bits that leave the fast path
    pub mask: GcState,
    pub null_check: bool,
    /// Consult the collection-set table before calling the stub
    pub cset_mid_path: bool,
    pub stub: StubKind,
}

impl LoadBarrierPlan {
    pub fn for_site(site: &LoadBarrierSite) -> Self {
        Self {
            strength: site.strength,
            mask: site.strength.gc_state_mask(),
            null_check: !site.not_null,
            cset_mid_path: site.strength == ReferenceStrength::Strong,
            stub: StubKind::load_barrier(site.strength, site.narrow),
        }
    }
}

/// Static shape of a pre-write barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreWritePlan {
    /// Previous value is statically null: no code at all
    pub elided: bool,
    pub load_previous: bool,
    /// Loaded previous value is compressed and must be decoded
    pub decode_previous: bool,
    pub null_check: bool,
    pub verify: bool,
    /// Try the thread-local buffer before calling the stub
    pub inline_enqueue: bool,
}

impl PreWritePlan {
    pub fn for_site(site: &PreWriteSite, config: &BarrierConfig) -> Self {
        let elided = site.previous == PreviousValue::ConstantNull;
        let load_previous = site.previous == PreviousValue::Load;
        Self {
            elided,
            load_previous,
            decode_previous: load_previous && config.compressed_oops.is_some(),
            null_check: !site.non_null,
            verify: config.verify_oops,
            inline_enqueue: !config.slow_path_only,
        }
    }
}

/// Path taken by one execution of a load reference barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPath {
    /// Null input short-circuits before the GC state is read
    NullInput,
    /// GC state clear for this strength
    Fast,
    /// Forwarded objects exist but this one is outside the collection set
    CsetFiltered,
    /// Runtime stub called
    Slow,
}

impl LoadPath {
    /// Result register equals the input
    pub fn preserves_input(self) -> bool {
        !matches!(self, LoadPath::Slow)
    }

    pub fn calls_stub(self) -> bool {
        matches!(self, LoadPath::Slow)
    }
}

/// Reference decision for a load reference barrier
pub fn load_barrier_path(
    state: GcState,
    strength: ReferenceStrength,
    not_null: bool,
    object_is_null: bool,
    in_cset: bool,
) -> LoadPath {
    if object_is_null && !not_null {
        return LoadPath::NullInput;
    }
    if !state.intersects(strength.gc_state_mask()) {
        return LoadPath::Fast;
    }
    match strength {
        ReferenceStrength::Strong if !in_cset => LoadPath::CsetFiltered,
        _ => LoadPath::Slow,
    }
}

/// Path taken by one execution of a pre-write barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreWritePath {
    Elided,
    NotMarking,
    NullPrevious,
    /// Logged into the thread-local buffer
    Enqueue,
    /// Handed to the pre-write stub
    Runtime,
}

impl PreWritePath {
    pub fn logs(self) -> bool {
        matches!(self, PreWritePath::Enqueue | PreWritePath::Runtime)
    }
}

/// Reference decision for a pre-write barrier
pub fn pre_write_path(
    state: GcState,
    plan: &PreWritePlan,
    previous_is_null: bool,
    satb_index: u64,
) -> PreWritePath {
    if plan.elided {
        return PreWritePath::Elided;
    }
    if !state.contains(GcState::MARKING) {
        return PreWritePath::NotMarking;
    }
    if previous_is_null && plan.null_check {
        return PreWritePath::NullPrevious;
    }
    if !plan.inline_enqueue || satb_index == 0 {
        PreWritePath::Runtime
    } else {
        PreWritePath::Enqueue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shen_lir::amd64::*;
    use shen_lir::Address;

    fn strong_site() -> LoadBarrierSite {
        LoadBarrierSite::new(RAX, RBX, Address::base(RSI), ReferenceStrength::Strong, [RCX, RDX])
    }

    #[test]
    fn test_load_plan() {
        let plan = LoadBarrierPlan::for_site(&strong_site());
        assert_eq!(plan.mask, GcState::HAS_FORWARDED);
        assert!(plan.null_check);
        assert!(plan.cset_mid_path);
        assert_eq!(plan.stub, StubKind::LoadBarrierStrong);

        let weak = LoadBarrierSite { strength: ReferenceStrength::Weak, ..strong_site() }
            .narrow(true)
            .not_null(true);
        let plan = LoadBarrierPlan::for_site(&weak);
        assert_eq!(plan.mask.bits(), 0x11);
        assert!(!plan.null_check);
        assert!(!plan.cset_mid_path);
        assert_eq!(plan.stub, StubKind::LoadBarrierWeakNarrow);
    }

    #[test]
    fn test_load_path_table() {
        use ReferenceStrength::*;
        let fwd = GcState::HAS_FORWARDED;
        assert_eq!(load_barrier_path(GcState::IDLE, Strong, false, false, true), LoadPath::Fast);
        assert_eq!(load_barrier_path(fwd, Strong, false, true, true), LoadPath::NullInput);
        assert_eq!(load_barrier_path(fwd, Strong, false, false, false), LoadPath::CsetFiltered);
        assert_eq!(load_barrier_path(fwd, Strong, false, false, true), LoadPath::Slow);
        assert_eq!(load_barrier_path(GcState::WEAK_ROOTS, Strong, true, false, true), LoadPath::Fast);
        assert_eq!(load_barrier_path(GcState::WEAK_ROOTS, Weak, true, false, false), LoadPath::Slow);
        assert_eq!(load_barrier_path(GcState::WEAK_ROOTS, Phantom, false, false, false), LoadPath::Slow);
        assert_eq!(load_barrier_path(GcState::MARKING, Weak, false, false, true), LoadPath::Fast);
    }

    #[test]
    fn test_pre_write_path_table() {
        let site = PreWriteSite::load(Address::base(RSI), RCX, RDX);
        let config = BarrierConfig::default();
        let plan = PreWritePlan::for_site(&site, &config);
        assert!(plan.load_previous && plan.null_check && plan.inline_enqueue);
        assert!(!plan.decode_previous);

        assert_eq!(pre_write_path(GcState::IDLE, &plan, false, 8), PreWritePath::NotMarking);
        assert_eq!(pre_write_path(GcState::MARKING, &plan, true, 8), PreWritePath::NullPrevious);
        assert_eq!(pre_write_path(GcState::MARKING, &plan, false, 8), PreWritePath::Enqueue);
        assert_eq!(pre_write_path(GcState::MARKING, &plan, false, 0), PreWritePath::Runtime);

        let forced = PreWritePlan::for_site(
            &site,
            &BarrierConfig { slow_path_only: true, ..Default::default() },
        );
        assert_eq!(pre_write_path(GcState::MARKING, &forced, false, 64), PreWritePath::Runtime);
    }

    #[test]
    fn test_constant_null_is_elided() {
        let site = PreWriteSite {
            previous: PreviousValue::ConstantNull,
            temp2: None,
            ..PreWriteSite::load(Address::base(RSI), RCX, RDX)
        };
        let plan = PreWritePlan::for_site(&site, &BarrierConfig::default());
        assert!(plan.elided);
        assert_eq!(pre_write_path(GcState::MARKING, &plan, false, 8), PreWritePath::Elided);
    }
}
