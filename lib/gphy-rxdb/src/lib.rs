// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The receive database: a bounded, two-tier store for frames the modem has
//! sent us that nobody has claimed yet.
//!
//! The receive loop pushes every control-plane frame in here; request threads
//! later find-and-pop the confirmation that matches their `(msg_id, req_id)`.
//! Two tiers exist because the two kinds of traffic age differently:
//!
//! - the **main** tier holds request/confirm traffic, which some caller is
//!   actively waiting for and will drain promptly;
//! - the **indication** tier holds unsolicited notifications, which no one may
//!   ever ask for, so a background cleaner evicts entries older than
//!   [`INDICATION_TTL_SECS`].
//!
//! Both tiers are sized once, at construction, from the caller's memory
//! budget ([`gphy_pool::Pool`]); after that the store never allocates. Each
//! tier is guarded by its own mutex, and scans run oldest-first so the
//! earliest matching frame always wins.

mod tier;

use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use gphy_pool::Pool;
use gphy_proto::{Packet, Tier};

use crate::tier::{Link, TierCore};

/// Seconds an unclaimed indication survives before the cleaner evicts it.
pub const INDICATION_TTL_SECS: u64 = 5;

/// Cleaner wake-up period.
pub const CLEANER_SLEEP_SECS: u64 = 1;

/// Fraction of the memory area granted to the main tier.
pub const MAIN_DB_SIZE_PROPORTION: f64 = 0.8;

/// Fewest main-tier slots we are willing to run with.
pub const MIN_MAIN_SLOTS: usize = 5;

/// Fewest indication-tier slots we are willing to run with.
pub const MIN_INDICATION_SLOTS: usize = 2;

/// Headroom charged per tier for allocator bookkeeping, in pointers.
const POINTER_SLACK: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum RxDbError {
    /// Every slot in the addressed tier is occupied.
    #[error("receive database tier is full")]
    Full,
    /// No stored frame matches the query.
    #[error("no matching frame")]
    NotFound,
    /// The memory area cannot pay for the minimum slot counts.
    #[error("memory area too small: room for {got} {tier} slots, minimum is {min}")]
    TooSmall {
        tier: &'static str,
        got: usize,
        min: usize,
    },
    /// The pool refused an allocation the sizing pass said would fit.
    #[error("memory budget exhausted")]
    NoMemory,
    /// The cleaner thread could not be spawned.
    #[error("failed to spawn cleaner thread")]
    Thread,
}

/// Main-tier slot: the frame plus its received wire length.
#[derive(Copy, Clone)]
struct SizedPacket {
    packet: Packet,
    size: u16,
}

impl Default for SizedPacket {
    fn default() -> Self {
        Self {
            packet: Packet::default(),
            size: 0,
        }
    }
}

/// Indication-tier slot: the frame plus its arrival time.
#[derive(Copy, Clone)]
struct StampedPacket {
    packet: Packet,
    timestamp_secs: u64,
}

impl Default for StampedPacket {
    fn default() -> Self {
        Self {
            packet: Packet::default(),
            timestamp_secs: 0,
        }
    }
}

/// State shared with the cleaner thread.
struct IndicationShared {
    tier: Mutex<TierCore<StampedPacket>>,
    /// Shutdown flag, paired with `cond`. Lock order where both are needed:
    /// this lock first, then the tier mutex. Never the reverse.
    running: Mutex<bool>,
    cond: Condvar,
}

pub struct RxDb {
    main: Mutex<TierCore<SizedPacket>>,
    shared: std::sync::Arc<IndicationShared>,
    cleaner: Option<thread::JoinHandle<()>>,
    main_capacity: usize,
    indication_capacity: usize,
}

/// Seconds of process uptime. Monotonic, so TTL arithmetic is immune to
/// wall-clock steps.
fn now_secs() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded structures are repaired-or-consistent after any panic point,
    // so a poisoned lock is safe to keep using.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Slots that fit in `area` bytes once the tier's fixed overhead is paid.
fn possible_slots(area: usize, tier: Tier) -> usize {
    use core::mem::size_of;

    let slack = POINTER_SLACK * size_of::<usize>();
    let (fixed, per_slot) = match tier {
        Tier::Main => (
            size_of::<Mutex<TierCore<SizedPacket>>>() + size_of::<Vec<usize>>() + slack,
            size_of::<SizedPacket>() + size_of::<Link>() + size_of::<usize>(),
        ),
        Tier::Indication => (
            size_of::<Mutex<TierCore<StampedPacket>>>()
                + size_of::<Mutex<bool>>()
                + size_of::<Condvar>()
                + size_of::<Vec<usize>>()
                + slack,
            size_of::<StampedPacket>() + size_of::<Link>() + size_of::<usize>(),
        ),
    };
    if fixed > area {
        return 0;
    }
    (area - fixed) / per_slot
}

/// Evicts every entry whose TTL has elapsed at `now`.
fn sweep(tier: &mut TierCore<StampedPacket>, now: u64) {
    let mut cursor = tier.head;
    while let Some(slot) = cursor {
        // The successor is captured before a possible unlink, so removal
        // cannot derail the walk.
        cursor = tier.links[slot].next;
        if tier.slots[slot].timestamp_secs + INDICATION_TTL_SECS <= now {
            tier.unlink_and_free(slot);
        }
    }
}

fn cleaner_loop(shared: &IndicationShared) {
    loop {
        let mut running = lock(&shared.running);
        if *running {
            let (guard, _) = shared
                .cond
                .wait_timeout(running, Duration::from_secs(CLEANER_SLEEP_SECS))
                .unwrap_or_else(PoisonError::into_inner);
            running = guard;
        }
        let keep_going = *running;
        drop(running);
        if !keep_going {
            break;
        }

        let mut tier = lock(&shared.tier);
        if tier.is_empty() {
            continue;
        }
        sweep(&mut tier, now_secs());
    }
}

impl RxDb {
    /// Sizes both tiers from the pool's remaining budget and starts the
    /// cleaner.
    ///
    /// The main tier gets [`MAIN_DB_SIZE_PROPORTION`] of the area and the
    /// indication tier the rest; each must clear its minimum slot count or
    /// construction is refused.
    pub fn new(pool: &Pool) -> Result<Self, RxDbError> {
        let area = pool.remaining();

        let main_capacity =
            possible_slots((area as f64 * MAIN_DB_SIZE_PROPORTION) as usize, Tier::Main);
        if main_capacity < MIN_MAIN_SLOTS {
            log::info!(
                "memory area too small: room for {main_capacity} main slots, \
                 minimum is {MIN_MAIN_SLOTS}"
            );
            return Err(RxDbError::TooSmall {
                tier: "main",
                got: main_capacity,
                min: MIN_MAIN_SLOTS,
            });
        }

        let indication_capacity = possible_slots(
            (area as f64 * (1.0 - MAIN_DB_SIZE_PROPORTION)) as usize,
            Tier::Indication,
        );
        if indication_capacity < MIN_INDICATION_SLOTS {
            log::info!(
                "memory area too small: room for {indication_capacity} indication \
                 slots, minimum is {MIN_INDICATION_SLOTS}"
            );
            return Err(RxDbError::TooSmall {
                tier: "indication",
                got: indication_capacity,
                min: MIN_INDICATION_SLOTS,
            });
        }

        log::info!("rx db main tier: {main_capacity} slots");
        log::info!("rx db indication tier: {indication_capacity} slots");

        // Debit the budget for everything the tiers hold, mirroring the
        // sizing arithmetic above.
        {
            use core::mem::size_of;
            let mut charge = |n: usize| pool.alloc(n).ok_or(RxDbError::NoMemory);
            charge(main_capacity * size_of::<SizedPacket>())?;
            charge(main_capacity * size_of::<Link>())?;
            charge(main_capacity * size_of::<usize>())?;
            charge(size_of::<Mutex<TierCore<SizedPacket>>>())?;
            charge(indication_capacity * size_of::<StampedPacket>())?;
            charge(indication_capacity * size_of::<Link>())?;
            charge(indication_capacity * size_of::<usize>())?;
            charge(size_of::<Mutex<TierCore<StampedPacket>>>())?;
            charge(size_of::<Mutex<bool>>() + size_of::<Condvar>())?;
        }

        Self::start(main_capacity, indication_capacity)
    }

    fn start(
        main_capacity: usize,
        indication_capacity: usize,
    ) -> Result<Self, RxDbError> {
        let shared = std::sync::Arc::new(IndicationShared {
            tier: Mutex::new(TierCore::new(indication_capacity)),
            running: Mutex::new(true),
            cond: Condvar::new(),
        });

        let cleaner = {
            let shared = std::sync::Arc::clone(&shared);
            thread::Builder::new()
                .name("gphy-rxdb-cleaner".into())
                .spawn(move || cleaner_loop(&shared))
                .map_err(|e| {
                    log::error!("failed to spawn cleaner thread: {e}");
                    RxDbError::Thread
                })?
        };

        Ok(Self {
            main: Mutex::new(TierCore::new(main_capacity)),
            shared,
            cleaner: Some(cleaner),
            main_capacity,
            indication_capacity,
        })
    }

    /// Stores one received frame in the tier its message id routes to.
    pub fn push(&self, packet: &Packet, size: u16) -> Result<(), RxDbError> {
        match Tier::of(packet.msg_id()) {
            Tier::Main => lock(&self.main)
                .push(SizedPacket {
                    packet: *packet,
                    size,
                })
                .map_err(|_| RxDbError::Full),
            Tier::Indication => lock(&self.shared.tier)
                .push(StampedPacket {
                    packet: *packet,
                    timestamp_secs: now_secs(),
                })
                .map_err(|_| RxDbError::Full),
        }
    }

    /// Removes and returns the oldest frame matching a single-fragment query.
    pub fn find_and_pop(&self, msg_id: u16, req_id: u16) -> Result<Packet, RxDbError> {
        self.find_and_pop_fragment(msg_id, req_id, 0, 0)
            .map(|(packet, _)| packet)
    }

    /// Removes and returns the oldest frame matching a fragment query, along
    /// with its received wire length.
    ///
    /// On the main tier, a first fragment (`frag_idx == 0`) matches on
    /// `req_id` alone (the first fragment is the one that carries the
    /// authoritative request id), while later fragments match on their
    /// series' `fmsn`. The indication tier ignores fragment fields entirely
    /// and reports a wire length of zero (it does not record sizes).
    pub fn find_and_pop_fragment(
        &self,
        msg_id: u16,
        req_id: u16,
        frag_idx: u8,
        fmsn: u8,
    ) -> Result<(Packet, usize), RxDbError> {
        match Tier::of(msg_id) {
            Tier::Main => lock(&self.main)
                .pop_first_match(|e| {
                    let p = &e.packet;
                    p.frag_idx() == frag_idx
                        && p.msg_id() == msg_id
                        && ((frag_idx > 0 && p.fmsn() == fmsn)
                            || p.req_id() == req_id)
                })
                .map(|e| (e.packet, e.size as usize))
                .ok_or(RxDbError::NotFound),
            Tier::Indication => lock(&self.shared.tier)
                .pop_first_match(|e| {
                    e.packet.msg_id() == msg_id && e.packet.req_id() == req_id
                })
                .map(|e| (e.packet, 0))
                .ok_or(RxDbError::NotFound),
        }
    }

    /// Looks up the request id of a fragmented series by `(msg_id, fmsn)`,
    /// taken from its first fragment. Does not remove anything.
    ///
    /// The scan runs to the end of the list, so if two in-flight series ever
    /// shared `(msg_id, fmsn)` the later insertion would win; the protocol's
    /// 4-bit FMSN exists to keep concurrent series distinct, so in practice
    /// there is exactly one first fragment to find.
    pub fn find_req_id_of_series(
        &self,
        msg_id: u16,
        fmsn: u8,
    ) -> Result<u16, RxDbError> {
        let tier = lock(&self.main);
        let mut found = None;
        for slot in tier.indices() {
            let p = &tier.slots[slot].packet;
            if p.msg_id() == msg_id && p.fmsn() == fmsn && p.frag_idx() == 0 {
                found = Some(p.req_id());
            }
        }
        found.ok_or(RxDbError::NotFound)
    }

    /// `(req_id, msg_id)` of up to `max` main-tier frames, oldest first.
    pub fn list_main_ids(&self, max: usize) -> Vec<(u16, u16)> {
        let tier = lock(&self.main);
        tier.indices()
            .take(max)
            .map(|slot| {
                let p = &tier.slots[slot].packet;
                (p.req_id(), p.msg_id())
            })
            .collect()
    }

    /// Up to `max` main-tier frames, oldest first.
    pub fn list_main(&self, max: usize) -> Vec<Packet> {
        let tier = lock(&self.main);
        tier.indices()
            .take(max)
            .map(|slot| tier.slots[slot].packet)
            .collect()
    }

    /// Up to `max` indication-tier frames with their arrival times, oldest
    /// first.
    pub fn list_indication(&self, max: usize) -> Vec<(Packet, u64)> {
        let tier = lock(&self.shared.tier);
        tier.indices()
            .take(max)
            .map(|slot| {
                let e = &tier.slots[slot];
                (e.packet, e.timestamp_secs)
            })
            .collect()
    }

    pub fn capacity_main(&self) -> usize {
        self.main_capacity
    }

    pub fn capacity_indication(&self) -> usize {
        self.indication_capacity
    }

    /// Free indication slots right now.
    pub fn remaining_indication(&self) -> usize {
        lock(&self.shared.tier).free.len()
    }
}

impl Drop for RxDb {
    /// Teardown order: stop flag, wake the cleaner, join it. The slot arrays
    /// fall with the struct; nothing is freed individually.
    fn drop(&mut self) {
        {
            let mut running = lock(&self.shared.running);
            *running = false;
            self.shared.cond.notify_one();
        }
        if let Some(handle) = self.cleaner.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
impl RxDb {
    /// Test constructor bypassing pool sizing.
    fn with_capacities(main: usize, indication: usize) -> Self {
        Self::start(main, indication).unwrap()
    }

    fn push_indication_at(&self, packet: &Packet, timestamp_secs: u64) {
        lock(&self.shared.tier)
            .push(StampedPacket {
                packet: *packet,
                timestamp_secs,
            })
            .unwrap();
    }

    fn sweep_indication_at(&self, now: u64) {
        sweep(&mut lock(&self.shared.tier), now);
    }

    fn assert_invariants(&self) {
        lock(&self.main).assert_invariants();
        lock(&self.shared.tier).assert_invariants();
    }
}
