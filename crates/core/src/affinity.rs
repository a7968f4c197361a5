// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker CPU affinity.
//!
//! Configuration is either `auto` (spread workers over the online CPUs,
//! one CPU each) or a list of bitmask strings, one per worker, where the
//! rightmost character is CPU 0. With more workers than masks the last
//! mask is reused.

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AffinityError {
    #[error("invalid character {0:?} in cpu affinity mask")]
    InvalidChar(char),

    #[error("empty cpu affinity mask")]
    EmptyMask,

    #[error("cpu affinity mask supports up to {0} CPUs only")]
    TooManyCpus(usize),

    #[error("cpu set operation failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// Resolved affinity configuration for a worker fleet.
#[derive(Debug, Clone)]
pub struct WorkerAffinity {
    auto: bool,
    masks: Vec<CpuSet>,
}

impl WorkerAffinity {
    /// Build from the `worker_cpu_affinity` directive values. `ncpu` is the
    /// online CPU count used to form the `auto` mask.
    pub fn parse(values: &[String], ncpu: usize) -> Result<Option<Self>, AffinityError> {
        let Some(first) = values.first() else {
            return Ok(None);
        };

        if first == "auto" {
            let mut all = CpuSet::new();
            for cpu in 0..ncpu.min(CpuSet::count()) {
                all.set(cpu)?;
            }
            // An explicit mask after "auto" narrows the CPUs considered.
            let mask = match values.get(1) {
                Some(explicit) => parse_mask(explicit)?,
                None => all,
            };
            return Ok(Some(Self { auto: true, masks: vec![mask] }));
        }

        let mut masks = Vec::with_capacity(values.len());
        for value in values {
            masks.push(parse_mask(value)?);
        }
        Ok(Some(Self { auto: false, masks }))
    }

    /// The mask worker `n` should bind to, or `None` when the auto mask
    /// turned out empty.
    pub fn mask_for(&self, n: usize) -> Option<CpuSet> {
        if self.auto {
            let mask = self.masks.last()?;
            let populated = popcount(mask);
            if populated == 0 {
                return None;
            }
            let target = nth_set_bit(mask, n % populated)?;
            let mut single = CpuSet::new();
            single.set(target).ok()?;
            return Some(single);
        }

        match self.masks.get(n) {
            Some(mask) => Some(*mask),
            None => self.masks.last().copied(),
        }
    }

    pub fn mask_count(&self) -> usize {
        self.masks.len()
    }

    pub fn is_auto(&self) -> bool {
        self.auto
    }
}

/// Bind the calling process to `mask`.
pub fn apply(mask: &CpuSet) -> Result<(), AffinityError> {
    sched_setaffinity(Pid::from_raw(0), mask)?;
    Ok(())
}

/// Parse one bitmask string, rightmost character = CPU 0. Spaces are
/// allowed as visual separators.
fn parse_mask(value: &str) -> Result<CpuSet, AffinityError> {
    let mut set = CpuSet::new();
    let mut cpu = 0usize;

    for ch in value.chars().rev() {
        match ch {
            ' ' => continue,
            '0' => cpu += 1,
            '1' => {
                if cpu >= CpuSet::count() {
                    return Err(AffinityError::TooManyCpus(CpuSet::count()));
                }
                set.set(cpu)?;
                cpu += 1;
            }
            other => return Err(AffinityError::InvalidChar(other)),
        }
    }

    if cpu == 0 {
        return Err(AffinityError::EmptyMask);
    }
    Ok(set)
}

fn popcount(mask: &CpuSet) -> usize {
    (0..CpuSet::count()).filter(|&cpu| mask.is_set(cpu).unwrap_or(false)).count()
}

fn nth_set_bit(mask: &CpuSet, n: usize) -> Option<usize> {
    (0..CpuSet::count()).filter(|&cpu| mask.is_set(cpu).unwrap_or(false)).nth(n)
}

#[cfg(test)]
#[path = "affinity_tests.rs"]
mod tests;
