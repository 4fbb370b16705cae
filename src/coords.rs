// Coordinate Space - physical and logical addressing of GPU threads
// Physical: (device, SM, warp, lane). Logical: (kernel, grid, block, thread).
// Filter coordinates mark individual fields as wildcards.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::kernels::KernelRegistry;
use crate::state::StateCache;

/// Three-component index, used for grid/block dimensions and block/thread indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// One coordinate field: either an exact value or a wildcard that matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field<T> {
    Wildcard,
    At(T),
}

impl<T: PartialEq + Copy> Field<T> {
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Field::Wildcard => true,
            Field::At(v) => v == value,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Field::Wildcard)
    }

    /// Exact value, if this field is not a wildcard.
    pub fn value(&self) -> Option<T> {
        match self {
            Field::Wildcard => None,
            Field::At(v) => Some(*v),
        }
    }
}

impl<T: fmt::Display> fmt::Display for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Wildcard => write!(f, "*"),
            Field::At(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordsError {
    #[error("coordinate is invalid")]
    Invalid,
    #[error("logical coordinate no longer resolves to a resident warp")]
    Unresolvable,
    #[error("physical field required but wildcarded")]
    MissingPhysical,
}

/// Full coordinate: physical plus logical fields, each possibly wildcarded.
/// An invalid coordinate carries no meaningful field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coords {
    pub valid: bool,
    pub dev: Field<u32>,
    pub sm: Field<u32>,
    pub wp: Field<u32>,
    pub ln: Field<u32>,
    pub kernel_id: Field<u64>,
    pub grid_id: Field<u64>,
    pub block_idx: Field<Dim3>,
    pub thread_idx: Field<Dim3>,
}

impl Coords {
    /// Filter matching every coordinate.
    pub fn wildcard() -> Self {
        Self {
            valid: true,
            dev: Field::Wildcard,
            sm: Field::Wildcard,
            wp: Field::Wildcard,
            ln: Field::Wildcard,
            kernel_id: Field::Wildcard,
            grid_id: Field::Wildcard,
            block_idx: Field::Wildcard,
            thread_idx: Field::Wildcard,
        }
    }

    pub fn invalid() -> Self {
        Self {
            valid: false,
            ..Self::wildcard()
        }
    }

    /// Exact physical coordinate; logical fields left wildcarded.
    pub fn physical(dev: u32, sm: u32, wp: u32, ln: u32) -> Self {
        Self {
            dev: Field::At(dev),
            sm: Field::At(sm),
            wp: Field::At(wp),
            ln: Field::At(ln),
            ..Self::wildcard()
        }
    }

    /// Field-wise match with wildcard semantics. An invalid coordinate
    /// matches nothing.
    pub fn matches(&self, other: &Coords) -> bool {
        if !self.valid || !other.valid {
            return false;
        }
        field_pair_matches(self.dev, other.dev)
            && field_pair_matches(self.sm, other.sm)
            && field_pair_matches(self.wp, other.wp)
            && field_pair_matches(self.ln, other.ln)
            && field_pair_matches(self.kernel_id, other.kernel_id)
            && field_pair_matches(self.grid_id, other.grid_id)
            && field_pair_matches(self.block_idx, other.block_idx)
            && field_pair_matches(self.thread_idx, other.thread_idx)
    }

    /// Exact physical tuple, or an error if any physical field is wildcarded
    /// or the coordinate is invalid.
    pub fn require_physical(&self) -> Result<(u32, u32, u32, u32), CoordsError> {
        if !self.valid {
            return Err(CoordsError::Invalid);
        }
        match (self.dev.value(), self.sm.value(), self.wp.value(), self.ln.value()) {
            (Some(d), Some(s), Some(w), Some(l)) => Ok((d, s, w, l)),
            _ => Err(CoordsError::MissingPhysical),
        }
    }
}

fn field_pair_matches<T: PartialEq + Copy>(a: Field<T>, b: Field<T>) -> bool {
    match (a, b) {
        (Field::Wildcard, _) | (_, Field::Wildcard) => true,
        (Field::At(x), Field::At(y)) => x == y,
    }
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return write!(f, "<invalid>");
        }
        write!(
            f,
            "device {} sm {} warp {} lane {} kernel {} grid {} block {} thread {}",
            self.dev, self.sm, self.wp, self.ln, self.kernel_id, self.grid_id, self.block_idx,
            self.thread_idx
        )
    }
}

/// The session's current focus: the host process or one device lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Host,
    Device(Coords),
}

impl Default for Focus {
    fn default() -> Self {
        Focus::Host
    }
}

impl Focus {
    /// Focused device coordinate; invalid when focus is on the host.
    pub fn current(&self) -> Coords {
        match self {
            Focus::Host => Coords::invalid(),
            Focus::Device(c) => *c,
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Focus::Device(_))
    }

    pub fn set_device(&mut self, coords: Coords) {
        debug_assert!(coords.valid);
        *self = Focus::Device(coords);
    }

    pub fn set_host(&mut self) {
        *self = Focus::Host;
    }

    /// Drops the device focus, forcing a later re-derivation from logical state.
    pub fn invalidate(&mut self) {
        *self = Focus::Host;
    }
}

/// Fills the physical fields of `coords` from its logical fields by scanning
/// resident warps. Fails if the logical coordinate no longer resolves, e.g.
/// the warp that held it has since exited.
pub fn complete_physical(
    cache: &mut StateCache,
    kernels: &KernelRegistry,
    coords: &mut Coords,
) -> Result<(), CoordsError> {
    if !coords.valid {
        return Err(CoordsError::Invalid);
    }
    let want_grid = match coords.grid_id {
        Field::At(g) => Some(g),
        Field::Wildcard => coords
            .kernel_id
            .value()
            .and_then(|id| kernels.find_by_kernel_id(id))
            .map(|h| kernels.record(h).grid_id),
    };

    let num_devices = cache.num_devices().map_err(|_| CoordsError::Unresolvable)?;
    for dev in 0..num_devices {
        if !coords.dev.matches(&dev) {
            continue;
        }
        let num_sms = cache.num_sms(dev).map_err(|_| CoordsError::Unresolvable)?;
        for sm in 0..num_sms {
            if !coords.sm.matches(&sm) {
                continue;
            }
            let valid_warps = cache
                .sm_valid_warps_mask(dev, sm)
                .map_err(|_| CoordsError::Unresolvable)?;
            for wp in valid_warps.iter() {
                if !coords.wp.matches(&wp) {
                    continue;
                }
                if let Some(g) = want_grid {
                    let grid = cache
                        .warp_grid_id(dev, sm, wp)
                        .map_err(|_| CoordsError::Unresolvable)?;
                    if grid != g {
                        continue;
                    }
                }
                if let Field::At(b) = coords.block_idx {
                    let block = cache
                        .warp_block_idx(dev, sm, wp)
                        .map_err(|_| CoordsError::Unresolvable)?;
                    if block != b {
                        continue;
                    }
                }
                let valid_lanes = cache
                    .warp_valid_lanes_mask(dev, sm, wp)
                    .map_err(|_| CoordsError::Unresolvable)?;
                for ln in valid_lanes.iter() {
                    if !coords.ln.matches(&ln) {
                        continue;
                    }
                    if let Field::At(t) = coords.thread_idx {
                        let tid = cache
                            .lane_thread_idx(dev, sm, wp, ln)
                            .map_err(|_| CoordsError::Unresolvable)?;
                        if tid != t {
                            continue;
                        }
                    }
                    coords.dev = Field::At(dev);
                    coords.sm = Field::At(sm);
                    coords.wp = Field::At(wp);
                    coords.ln = Field::At(ln);
                    if let Ok(g) = cache.warp_grid_id(dev, sm, wp) {
                        coords.grid_id = Field::At(g);
                        if let Some(h) = kernels.find_by_grid_id(dev, g) {
                            coords.kernel_id = Field::At(kernels.record(h).id);
                        }
                    }
                    return Ok(());
                }
            }
        }
    }
    Err(CoordsError::Unresolvable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_everything() {
        let filter = Coords::wildcard();
        let exact = Coords::physical(0, 1, 2, 3);
        assert!(filter.matches(&exact));
        assert!(exact.matches(&filter));
    }

    #[test]
    fn test_exact_mismatch() {
        let a = Coords::physical(0, 1, 2, 3);
        let b = Coords::physical(0, 1, 2, 4);
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_invalid_matches_nothing() {
        let inv = Coords::invalid();
        assert!(!inv.matches(&Coords::wildcard()));
        assert!(!Coords::wildcard().matches(&inv));
    }

    #[test]
    fn test_require_physical() {
        let c = Coords::physical(1, 2, 3, 4);
        assert_eq!(c.require_physical(), Ok((1, 2, 3, 4)));
        let mut partial = c;
        partial.ln = Field::Wildcard;
        assert_eq!(partial.require_physical(), Err(CoordsError::MissingPhysical));
        assert_eq!(Coords::invalid().require_physical(), Err(CoordsError::Invalid));
    }

    #[test]
    fn test_focus_transitions() {
        let mut focus = Focus::default();
        assert!(!focus.is_device());
        assert!(!focus.current().valid);
        focus.set_device(Coords::physical(0, 0, 0, 0));
        assert!(focus.is_device());
        focus.invalidate();
        assert!(!focus.is_device());
    }

    #[test]
    fn test_logical_field_match() {
        let mut filter = Coords::wildcard();
        filter.grid_id = Field::At(7);
        let mut c = Coords::physical(0, 0, 0, 0);
        c.grid_id = Field::At(7);
        assert!(filter.matches(&c));
        c.grid_id = Field::At(8);
        assert!(!filter.matches(&c));
    }
}
