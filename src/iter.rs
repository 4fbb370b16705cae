// Coordinate Iterator - filtered walk over the resident warp/lane space
// Depth-first over device, SM, warp, lane, skipping branches the cached
// valid masks exclude. The cursor is index-based, never a borrow into the
// cache, and is revalidated against the cache generation on every step.

use anyhow::Result;
use std::ops::BitOr;
use tracing::trace;

use crate::coords::{Coords, Field};
use crate::kernels::KernelRegistry;
use crate::state::StateCache;

/// Selection predicate flags, combinable with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Select(u8);

impl Select {
    /// Warp must be valid (resident).
    pub const VALID: Select = Select(1);
    /// Warp must sit at a breakpoint (broken-warp bit set).
    pub const AT_BREAKPOINT: Select = Select(2);
    /// Stop after the first match.
    pub const SINGLE: Select = Select(4);

    pub fn contains(&self, other: Select) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Select {
    type Output = Select;
    fn bitor(self, rhs: Select) -> Select {
        Select(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterLevel {
    Warps,
    Lanes,
}

/// Restartable, finite, lazy coordinate sequence. Logical filtering matches
/// the warp's cached grid id and block index; a kernel-id filter is resolved
/// against the kernel registry passed to each `next` call.
pub struct CoordIterator {
    filter: Coords,
    select: Select,
    level: IterLevel,
    dev: u32,
    sm: u32,
    wp: u32,
    ln: u32,
    started: bool,
    done: bool,
    emitted: usize,
    current: Option<Coords>,
    generation: u64,
}

impl CoordIterator {
    pub fn new(filter: Coords, select: Select, level: IterLevel) -> Self {
        Self {
            filter,
            select,
            level,
            dev: 0,
            sm: 0,
            wp: 0,
            ln: 0,
            started: false,
            done: false,
            emitted: 0,
            current: None,
            generation: 0,
        }
    }

    /// Rewinds to the beginning; the next `next` call starts a fresh walk.
    pub fn start(&mut self, cache: &StateCache) {
        self.dev = 0;
        self.sm = 0;
        self.wp = 0;
        self.ln = 0;
        self.started = true;
        self.done = false;
        self.emitted = 0;
        self.current = None;
        self.generation = cache.generation();
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The most recently emitted coordinate.
    pub fn current(&self) -> Option<Coords> {
        self.current
    }

    /// Advances to the next matching coordinate. Lazy: cache levels are
    /// populated only as the walk reaches them.
    pub fn next(
        &mut self,
        cache: &mut StateCache,
        kernels: &KernelRegistry,
    ) -> Result<Option<Coords>> {
        if !self.started {
            self.start(cache);
        }
        if self.done {
            return Ok(None);
        }
        if self.select.contains(Select::SINGLE) && self.emitted > 0 {
            self.done = true;
            return Ok(None);
        }
        if self.generation != cache.generation() {
            // index cursor stays meaningful; masks are simply re-read
            trace!("cache invalidated mid-iteration, revalidating cursor");
            self.generation = cache.generation();
        }

        let num_devices = cache.num_devices()?;
        while self.dev < num_devices {
            if !self.filter.dev.matches(&self.dev) {
                self.advance_dev();
                continue;
            }
            let num_sms = cache.num_sms(self.dev)?;
            while self.sm < num_sms {
                if !self.filter.sm.matches(&self.sm) {
                    self.advance_sm();
                    continue;
                }
                let valid_warps = cache.sm_valid_warps_mask(self.dev, self.sm)?;
                if valid_warps.is_empty() {
                    // whole branch excluded by the cached mask
                    self.advance_sm();
                    continue;
                }
                let broken_warps = if self.select.contains(Select::AT_BREAKPOINT) {
                    Some(cache.sm_broken_warps_mask(self.dev, self.sm)?)
                } else {
                    None
                };
                let num_warps = cache.num_warps(self.dev)?;
                while self.wp < num_warps {
                    if !self.warp_matches(cache, kernels, valid_warps, broken_warps)? {
                        self.advance_wp();
                        continue;
                    }
                    match self.level {
                        IterLevel::Warps => {
                            let coords = self.warp_coords(cache)?;
                            self.advance_wp();
                            self.emitted += 1;
                            self.current = Some(coords);
                            return Ok(Some(coords));
                        }
                        IterLevel::Lanes => {
                            let valid_lanes =
                                cache.warp_valid_lanes_mask(self.dev, self.sm, self.wp)?;
                            let num_lanes = cache.num_lanes(self.dev)?;
                            while self.ln < num_lanes {
                                if !valid_lanes.contains(self.ln)
                                    || !self.filter.ln.matches(&self.ln)
                                    || !self.lane_matches(cache)?
                                {
                                    self.ln += 1;
                                    continue;
                                }
                                let coords = self.lane_coords(cache)?;
                                self.ln += 1;
                                self.emitted += 1;
                                self.current = Some(coords);
                                return Ok(Some(coords));
                            }
                            self.advance_wp();
                        }
                    }
                }
                self.advance_sm();
            }
            self.advance_dev();
        }
        self.done = true;
        self.current = None;
        Ok(None)
    }

    fn advance_dev(&mut self) {
        self.dev += 1;
        self.sm = 0;
        self.wp = 0;
        self.ln = 0;
    }

    fn advance_sm(&mut self) {
        self.sm += 1;
        self.wp = 0;
        self.ln = 0;
    }

    fn advance_wp(&mut self) {
        self.wp += 1;
        self.ln = 0;
    }

    fn warp_matches(
        &mut self,
        cache: &mut StateCache,
        kernels: &KernelRegistry,
        valid_warps: crate::masks::WarpMask,
        broken_warps: Option<crate::masks::WarpMask>,
    ) -> Result<bool> {
        if !self.filter.wp.matches(&self.wp) {
            return Ok(false);
        }
        if self.select.contains(Select::VALID) && !valid_warps.contains(self.wp) {
            return Ok(false);
        }
        if let Some(broken) = broken_warps {
            if !broken.contains(self.wp) {
                return Ok(false);
            }
        }
        if !valid_warps.contains(self.wp) {
            // only valid warps carry meaningful logical state
            return Ok(false);
        }
        if let Field::At(grid) = self.filter.grid_id {
            if cache.warp_grid_id(self.dev, self.sm, self.wp)? != grid {
                return Ok(false);
            }
        }
        if let Field::At(kernel_id) = self.filter.kernel_id {
            let record = match kernels.find_by_kernel_id(kernel_id) {
                Some(h) => kernels.record(h),
                None => return Ok(false),
            };
            if record.dev != self.dev
                || cache.warp_grid_id(self.dev, self.sm, self.wp)? != record.grid_id
            {
                return Ok(false);
            }
        }
        if let Field::At(block) = self.filter.block_idx {
            if cache.warp_block_idx(self.dev, self.sm, self.wp)? != block {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn lane_matches(&mut self, cache: &mut StateCache) -> Result<bool> {
        if let Field::At(thread) = self.filter.thread_idx {
            if cache.lane_thread_idx(self.dev, self.sm, self.wp, self.ln)? != thread {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn warp_coords(&mut self, cache: &mut StateCache) -> Result<Coords> {
        let mut coords = Coords::wildcard();
        coords.dev = Field::At(self.dev);
        coords.sm = Field::At(self.sm);
        coords.wp = Field::At(self.wp);
        coords.grid_id = Field::At(cache.warp_grid_id(self.dev, self.sm, self.wp)?);
        coords.block_idx = Field::At(cache.warp_block_idx(self.dev, self.sm, self.wp)?);
        Ok(coords)
    }

    fn lane_coords(&mut self, cache: &mut StateCache) -> Result<Coords> {
        let mut coords = self.warp_coords(cache)?;
        coords.ln = Field::At(self.ln);
        coords.thread_idx =
            Field::At(cache.lane_thread_idx(self.dev, self.sm, self.wp, self.ln)?);
        Ok(coords)
    }
}
