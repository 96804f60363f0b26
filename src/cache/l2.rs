/*!
Shared L2 cache: the bridge between the private L1s and the directory.

Each line carries two coherence states:
- `state`   — how the directory sees this L2 (T in the protocol notes)
- `state_l1`— how this L2 sees its L1s (T_l1)
plus the set of L1s currently caching the line and an optional parked
message for in-flight transitions.

Invariants
- If any L1 holds the line Modified, `state_l1` is Modified and the sharer
  set is exactly that L1.
- `state` shared/exclusive with `state_l1` modified is a protocol bug.
- Transient `state` values are entered together with `pending` and cleared
  together.

Requests whose home memory controller is this tile's go straight to the
local directory; everything else rides the NoC.
*/

use std::collections::{BTreeSet, VecDeque};

use crate::cache::{CacheGeometry, CacheStats};
use crate::event::{EventSink, Mailbox, Port};
use crate::message::{AddressMap, CohState, CompId, CompKind, Message, MsgKind};
use crate::params::{ceil_by, Params, Scoped};

#[derive(Debug, Default)]
pub struct L2Entry {
    pub tag: u64,
    /// Directory-facing state.
    pub state: CohState,
    /// L1-facing state.
    pub state_l1: CohState,
    pub shared_l1: BTreeSet<CompId>,
    pub pending: Option<Message>,
    pub first_access_time: u64,
    pub last_access_time: u64,
}

pub struct CacheL2 {
    pub id: CompId,
    pub geom: CacheGeometry,
    pub process_interval: u64,

    to_l1_t: u64,
    to_dir_t: u64,
    to_xbar_t: u64,
    num_flits_per_packet: u32,
    always_hit: bool,
    display_life_time: bool,

    addr_map: AddressMap,
    pub directory: CompId,
    pub noc: CompId,

    tags: Vec<Vec<L2Entry>>,

    req_event: Mailbox,
    rep_event: Mailbox,
    rep_q: VecDeque<Message>,
    req_qs: Vec<VecDeque<Message>>,

    pub stats: CacheStats,
    num_ev_from_l1: u64,
    num_ev_from_l1_miss: u64,
    num_destroyed_cache_lines: u64,
    cache_line_life_time: u64,
    time_between_last_access_and_cache_destroy: u64,
}

impl CacheL2 {
    pub fn new(num: u32, params: &Params, addr_map: AddressMap) -> Self {
        let p = Scoped::new(params, CompKind::CacheL2.prefix());
        let geom = CacheGeometry {
            set_lsb: p.u64("set_lsb", 6) as u32,
            num_banks: p.u64("num_banks", 1) as u32,
            num_sets: p.u64("num_sets", 512) as u32,
            num_ways: p.u64("num_ways", 8) as u32,
        };
        let mut tags = Vec::with_capacity(geom.num_sets as usize);
        for _ in 0..geom.num_sets {
            let mut set = Vec::with_capacity(geom.num_ways as usize);
            for _ in 0..geom.num_ways {
                set.push(L2Entry::default());
            }
            tags.push(set);
        }
        Self {
            id: CompId::new(CompKind::CacheL2, num),
            geom,
            process_interval: p.u64("process_interval", 20),
            to_l1_t: p.u64("to_l1_t", 45),
            to_dir_t: p.u64("to_dir_t", 90),
            to_xbar_t: p.u64("to_xbar_t", 90),
            num_flits_per_packet: p.u64("num_flits_per_packet", 1) as u32,
            always_hit: p.bool("always_hit", false),
            display_life_time: p.bool("display_life_time", false),
            addr_map,
            directory: CompId::new(CompKind::Directory, num),
            noc: CompId::new(CompKind::Noc, 0),
            tags,
            req_event: Mailbox::default(),
            rep_event: Mailbox::default(),
            rep_q: VecDeque::new(),
            req_qs: vec![VecDeque::new(); geom.num_banks as usize],
            stats: CacheStats::default(),
            num_ev_from_l1: 0,
            num_ev_from_l1_miss: 0,
            num_destroyed_cache_lines: 0,
            cache_line_life_time: 0,
            time_between_last_access_and_cache_destroy: 0,
        }
    }

    pub fn add_req_event(&mut self, event_time: u64, msg: Message, sink: &mut EventSink) {
        let event_time = ceil_by(event_time, self.process_interval);
        sink.wake(event_time, self.id);
        self.req_event.insert(event_time, msg);
    }

    pub fn add_rep_event(&mut self, event_time: u64, msg: Message, sink: &mut EventSink) {
        let event_time = ceil_by(event_time, self.process_interval);
        sink.wake(event_time, self.id);
        self.rep_event.insert(event_time, msg);
    }

    /// (directory-facing, L1-facing) states of `address`, if tracked.
    pub fn line_states(&self, address: u64) -> Option<(CohState, CohState)> {
        let set = self.geom.set_of(address);
        let tag = self.geom.tag_of(address);
        self.tags[set]
            .iter()
            .find(|e| e.state != CohState::Invalid && e.tag == tag)
            .map(|e| (e.state, e.state_l1))
    }

    pub fn sharer_count(&self, address: u64) -> usize {
        let set = self.geom.set_of(address);
        let tag = self.geom.tag_of(address);
        self.tags[set]
            .iter()
            .find(|e| e.state != CohState::Invalid && e.tag == tag)
            .map(|e| e.shared_l1.len())
            .unwrap_or(0)
    }

    pub fn mailboxes_empty(&self) -> bool {
        self.req_event.is_empty()
            && self.rep_event.is_empty()
            && self.rep_q.is_empty()
            && self.req_qs.iter().all(VecDeque::is_empty)
    }

    fn find_way(&self, set: usize, tag: u64) -> Option<usize> {
        self.tags[set]
            .iter()
            .position(|e| e.state != CohState::Invalid && e.tag == tag)
    }

    fn promote(&mut self, set: usize, idx: usize) {
        let entry = self.tags[set].remove(idx);
        self.tags[set].push(entry);
    }

    fn line_addr(&self, set: usize, idx: usize) -> u64 {
        self.geom.line_addr(set, self.tags[set][idx].tag)
    }

    /// Send toward the lower level. `check_top` routes by the back-stack
    /// (top == local directory means the transaction started there);
    /// otherwise the home controller of the address decides. Data-bearing
    /// hops occupy `num_flits_per_packet` flits on the NoC.
    fn send_to_ll(&self, curr_time: u64, msg: Message, check_top: bool, is_data: bool, sink: &mut EventSink) {
        let local = if check_top {
            msg.top() == self.directory
        } else {
            self.addr_map.which_mc(msg.address) == self.directory.num
        };
        if local {
            sink.rep(curr_time + self.to_dir_t, self.directory, msg);
        } else if is_data {
            sink.send_data(
                curr_time + self.to_xbar_t,
                self.noc,
                Port::Rep,
                msg,
                self.num_flits_per_packet,
            );
        } else {
            sink.rep(curr_time + self.to_xbar_t, self.noc, msg);
        }
    }

    /// Evict the line from the L1 sharers. With `always` false the requester
    /// on top of `exclude` keeps its copy.
    fn req_l1_evict(
        &mut self,
        curr_time: u64,
        set: usize,
        idx: usize,
        addr: u64,
        th_id: u32,
        exclude: Option<CompId>,
        sink: &mut EventSink,
    ) {
        let sharers: Vec<CompId> = self.tags[set][idx].shared_l1.iter().copied().collect();
        for l1 in sharers {
            if exclude != Some(l1) {
                let lqe = Message::new(self.id, MsgKind::Evict, addr, th_id);
                sink.rep(curr_time + self.to_l1_t, l1, lqe);
            }
        }
        self.tags[set][idx].shared_l1.clear();
    }

    fn destroy_line_stats(&mut self, curr_time: u64, set: usize, idx: usize) {
        self.num_destroyed_cache_lines += 1;
        self.cache_line_life_time +=
            curr_time.saturating_sub(self.tags[set][idx].first_access_time);
        self.time_between_last_access_and_cache_destroy +=
            curr_time.saturating_sub(self.tags[set][idx].last_access_time);
    }

    pub fn process_event(&mut self, curr_time: u64, sink: &mut EventSink) {
        let mut rep_lqe = if let Some(m) = self.rep_q.pop_front() {
            Some(m)
        } else {
            self.rep_event.pop_at(curr_time)
        };
        for m in self.rep_event.drain_at(curr_time) {
            self.rep_q.push_back(m);
        }
        for m in self.req_event.drain_at(curr_time) {
            let bank = self.geom.bank_of(m.address);
            self.req_qs[bank].push_back(m);
        }

        if let Some(msg) = rep_lqe.take() {
            self.process_reply(curr_time, msg, sink);
        } else {
            for bank in 0..self.req_qs.len() {
                if let Some(msg) = self.req_qs[bank].pop_front() {
                    self.process_request(curr_time, msg, sink);
                }
            }
        }

        if !self.rep_q.is_empty() || self.req_qs.iter().any(|q| !q.is_empty()) {
            sink.wake(curr_time + self.process_interval, self.id);
        }
    }

    fn process_reply(&mut self, curr_time: u64, mut msg: Message, sink: &mut EventSink) {
        let address = msg.address;
        let set = self.geom.set_of(address);
        let tag = self.geom.tag_of(address);
        let etype = msg.kind;
        let way = self.find_way(set, tag);

        match etype {
            MsgKind::WriteNd => {
                // Directory granted the E->M upgrade without data.
                msg.pop();
                match way {
                    Some(idx) if self.tags[set][idx].state == CohState::TrToM => {
                        let line = self.line_addr(set, idx);
                        let l1 = msg.top();
                        self.req_l1_evict(curr_time, set, idx, line, msg.th_id, Some(l1), sink);
                        let entry = &mut self.tags[set][idx];
                        entry.state = CohState::Modified;
                        entry.state_l1 = CohState::Modified;
                        entry.tag = tag;
                        entry.shared_l1.insert(l1);
                        entry.last_access_time = curr_time;
                        self.promote(set, idx);

                        msg.kind = MsgKind::Write;
                        sink.rep(curr_time + self.to_l1_t, l1, msg);

                        let lqe = Message::new(self.id, MsgKind::EToM, address, 0);
                        self.send_to_ll(curr_time, lqe, false, false, sink);
                    }
                    _ => {
                        // Line already recycled under us; undo at the
                        // directory and retry at the L1.
                        let l1 = msg.top();
                        let th_id = msg.th_id;
                        msg.kind = MsgKind::Nack;
                        sink.rep(curr_time + self.to_l1_t, l1, msg);
                        let lqe = Message::new(self.id, MsgKind::EToI, address, th_id);
                        self.send_to_ll(curr_time, lqe, false, false, sink);
                    }
                }
            }

            MsgKind::ERd | MsgKind::SRd | MsgKind::Write => {
                // Miss return traffic from the directory / memory side.
                msg.pop();
                let mut shared = false;
                let idx;
                match way {
                    None => {
                        idx = 0;
                        let vstate = self.tags[set][0].state;
                        let vstate_l1 = self.tags[set][0].state_l1;
                        let set_addr = self.line_addr(set, 0);
                        if vstate.is_transient() && vstate != CohState::MToS {
                            // The victim way is mid-transition; nobody can
                            // accept this data, push it back to memory.
                            let th_id = msg.th_id;
                            if msg.from.len() > 1 {
                                let l1 = msg.top();
                                msg.kind = MsgKind::Nack;
                                sink.rep(curr_time + self.to_l1_t, l1, msg);
                            }
                            let lqe = Message::new(self.id, MsgKind::Evict, address, th_id);
                            self.send_to_ll(curr_time, lqe, false, false, sink);
                            self.stats.num_bypass += 1;
                            return;
                        } else if vstate != CohState::Invalid {
                            // Capacity eviction.
                            self.stats.num_ev_capacity += 1;
                            self.destroy_line_stats(curr_time, set, 0);
                            self.tags[set][0].first_access_time = curr_time;
                            self.tags[set][0].last_access_time = curr_time;
                            self.req_l1_evict(curr_time, set, 0, set_addr, msg.th_id, None, sink);
                            if vstate_l1 != CohState::Modified {
                                let lqe = Message::new(self.id, MsgKind::Evict, set_addr, msg.th_id);
                                self.send_to_ll(curr_time, lqe, false, vstate == CohState::Modified, sink);
                            }
                            // A dirty L1 copy arrives later via the L1's own
                            // eviction path.
                        } else {
                            self.tags[set][0].first_access_time = curr_time;
                            self.tags[set][0].last_access_time = curr_time;
                        }
                    }
                    Some(found) => {
                        idx = found;
                        let set_addr = self.line_addr(set, idx);
                        if etype == MsgKind::Write {
                            let l1 = msg.top();
                            self.req_l1_evict(curr_time, set, idx, set_addr, msg.th_id, Some(l1), sink);
                        } else {
                            let state = self.tags[set][idx].state;
                            if state == CohState::Modified || state == CohState::TrToE {
                                // This reply is older than the line's current
                                // state; serve the caller only.
                                if msg.from.len() > 1 {
                                    let l1 = msg.top();
                                    msg.kind = MsgKind::RdBypass;
                                    sink.rep(curr_time + self.to_l1_t, l1, msg);
                                }
                                self.stats.num_bypass += 1;
                                return;
                            } else if etype == MsgKind::SRd {
                                shared = true;
                            }
                        }
                    }
                }

                let has_upstream = msg.from.len() > 1;
                let entry = &mut self.tags[set][idx];
                entry.state = match etype {
                    MsgKind::ERd => CohState::Exclusive,
                    MsgKind::SRd => CohState::Shared,
                    _ => CohState::Modified,
                };
                entry.tag = tag;
                if has_upstream {
                    entry.state_l1 = if etype == MsgKind::Write {
                        CohState::Modified
                    } else if shared {
                        CohState::Shared
                    } else {
                        CohState::Exclusive
                    };
                    entry.shared_l1.insert(msg.top());
                } else {
                    entry.state_l1 = CohState::Invalid;
                }
                entry.last_access_time = curr_time;
                self.promote(set, idx);

                msg.kind = if etype == MsgKind::Write {
                    MsgKind::Write
                } else {
                    MsgKind::Read
                };
                if has_upstream {
                    let l1 = msg.top();
                    sink.rep(curr_time + self.to_l1_t, l1, msg);
                }
            }

            MsgKind::MToS | MsgKind::MToM => {
                msg.pop();
                self.stats.num_coherency_access += 1;
                match way {
                    Some(idx)
                        if self.tags[set][idx].state == CohState::TrToI
                            && self.tags[set][idx].pending.is_some() =>
                    {
                        // The dirty line returned while an invalidation was
                        // parked: finish the invalidation.
                        self.stats.num_ev_coherency += 1;
                        match self.tags[set][idx].state_l1 {
                            CohState::TrToI => drop(msg),
                            CohState::TrToM => {
                                let l1 = msg.top();
                                msg.kind = MsgKind::Nack;
                                sink.rep(curr_time + self.to_l1_t, l1, msg);
                            }
                            _ => {
                                let l1 = msg.top();
                                let line = self.line_addr(set, idx);
                                let th_id = msg.th_id;
                                msg.kind = MsgKind::Nack;
                                sink.rep(curr_time + self.to_l1_t, l1, msg);
                                self.tags[set][idx].shared_l1.insert(l1);
                                self.req_l1_evict(curr_time, set, idx, line, th_id, None, sink);
                            }
                        }
                        let pending = self.tags[set][idx].pending.take().expect("pending checked");
                        self.send_to_ll(curr_time, pending, true, true, sink);
                        self.destroy_line_stats(curr_time, set, idx);
                        self.tags[set][idx].state = CohState::Invalid;
                        self.tags[set][idx].state_l1 = CohState::Invalid;
                        self.promote(set, idx);
                    }
                    Some(idx)
                        if matches!(
                            self.tags[set][idx].state_l1,
                            CohState::TrToM | CohState::TrToS
                        ) =>
                    {
                        self.stats.num_ev_coherency += 1;
                        let l1 = msg.top();
                        let entry = &mut self.tags[set][idx];
                        entry.last_access_time = curr_time;
                        let was_tr_to_s = entry.state_l1 == CohState::TrToS;
                        let has_pending = entry.pending.is_some();
                        entry.state_l1 = if was_tr_to_s {
                            CohState::Shared
                        } else if has_pending {
                            CohState::Invalid
                        } else {
                            CohState::Modified
                        };
                        entry.shared_l1.insert(l1);
                        msg.kind = if etype == MsgKind::MToS {
                            MsgKind::Read
                        } else if has_pending {
                            MsgKind::Nack
                        } else {
                            MsgKind::Write
                        };
                        sink.rep(curr_time + self.to_l1_t, l1, msg);
                        if let Some(pending) = self.tags[set][idx].pending.take() {
                            self.send_to_ll(curr_time, pending, true, true, sink);
                            self.tags[set][idx].state = CohState::Shared;
                        }
                        self.promote(set, idx);
                    }
                    _ => {
                        panic!("{}: unexpected {} at {}", self.id, msg, curr_time);
                    }
                }
            }

            MsgKind::Evict | MsgKind::EvictNd => {
                self.num_ev_from_l1 += 1;
                match way {
                    Some(idx) => {
                        self.tags[set][idx].last_access_time = curr_time;
                        if self.tags[set][idx].state == CohState::TrToS {
                            self.stats.num_coherency_access += 1;
                            self.tags[set][idx].state = CohState::Shared;
                            let pending =
                                self.tags[set][idx].pending.take().unwrap_or_else(|| {
                                    panic!("{}: tr_to_s without pending: {}", self.id, msg)
                                });
                            self.send_to_ll(curr_time, pending, true, true, sink);
                            let l1 = msg.top();
                            self.tags[set][idx].shared_l1.insert(l1);
                        } else {
                            let l1 = msg.top();
                            self.tags[set][idx].shared_l1.remove(&l1);
                            let entry = &mut self.tags[set][idx];
                            if entry.shared_l1.is_empty()
                                && !matches!(
                                    entry.state_l1,
                                    CohState::TrToS | CohState::TrToM | CohState::TrToI
                                )
                            {
                                entry.state_l1 = CohState::Invalid;
                            }
                            self.promote(set, idx);
                        }
                    }
                    None => {
                        self.num_ev_from_l1_miss += 1;
                        if etype == MsgKind::Evict && !self.always_hit {
                            // Dirty line we no longer track: pass the
                            // writeback toward memory.
                            msg.push(self.id);
                            self.send_to_ll(curr_time, msg, true, true, sink);
                        }
                    }
                }
            }

            MsgKind::DirRd => {
                self.stats.num_coherency_access += 1;
                match way {
                    None => {
                        msg.kind = MsgKind::DirRdNd;
                        self.send_to_ll(curr_time, msg, false, false, sink);
                    }
                    Some(idx) => {
                        let state = self.tags[set][idx].state;
                        let state_l1 = self.tags[set][idx].state_l1;
                        if state != CohState::Modified {
                            panic!(
                                "{}: dir_rd against state {:?}: {}",
                                self.id, state, msg
                            );
                        }
                        match state_l1 {
                            CohState::Invalid | CohState::Exclusive | CohState::Shared => {
                                self.tags[set][idx].state = CohState::Shared;
                                self.tags[set][idx].last_access_time = curr_time;
                                self.send_to_ll(curr_time, msg, true, true, sink);
                            }
                            CohState::Modified => {
                                // Data is in an L1; fetch it first.
                                assert_eq!(
                                    self.tags[set][idx].shared_l1.len(),
                                    1,
                                    "{}: modified line with multiple sharers",
                                    self.id
                                );
                                let line = self.line_addr(set, idx);
                                let th_id = msg.th_id;
                                let owner =
                                    *self.tags[set][idx].shared_l1.iter().next().expect("sharer");
                                let entry = &mut self.tags[set][idx];
                                entry.last_access_time = curr_time;
                                entry.state_l1 = CohState::Exclusive;
                                entry.state = CohState::TrToS;
                                entry.pending = Some(msg);
                                entry.shared_l1.clear();
                                let lqe = Message::new(self.id, MsgKind::DirRd, line, th_id);
                                sink.rep(curr_time + self.to_l1_t, owner, lqe);
                            }
                            CohState::TrToM | CohState::TrToS => {
                                assert!(
                                    self.tags[set][idx].pending.is_none(),
                                    "{}: pending already occupied",
                                    self.id
                                );
                                self.tags[set][idx].last_access_time = curr_time;
                                self.tags[set][idx].pending = Some(msg);
                            }
                            _ => panic!("{}: dir_rd in L1 state {:?}", self.id, state_l1),
                        }
                    }
                }
            }

            MsgKind::Nack => {
                self.stats.num_nack += 1;
                self.stats.num_bypass += 1;
                msg.pop();
                if msg.from.len() > 1 {
                    let l1 = msg.top();
                    sink.rep(curr_time + self.to_l1_t, l1, msg);
                }
            }

            MsgKind::EToS | MsgKind::SToS => {
                self.stats.num_coherency_access += 1;
                match way {
                    Some(idx) => {
                        let state = self.tags[set][idx].state;
                        if !matches!(
                            state,
                            CohState::Exclusive | CohState::Shared | CohState::TrToM
                        ) {
                            panic!(
                                "[{}] {}: {:?} received in state {:?}: {}",
                                curr_time, self.id, etype, state, msg
                            );
                        }
                        self.tags[set][idx].last_access_time = curr_time;
                        self.tags[set][idx].state = CohState::Shared;
                        self.send_to_ll(curr_time, msg, true, true, sink);
                    }
                    None => {
                        // The line left this L2 already; no data to give.
                        msg.kind = if etype == MsgKind::EToS {
                            MsgKind::EToSNd
                        } else {
                            MsgKind::SToSNd
                        };
                        self.send_to_ll(curr_time, msg, false, false, sink);
                    }
                }
            }

            MsgKind::Invalidate | MsgKind::InvalidateNd => {
                self.stats.num_coherency_access += 1;
                let mut enter_intermediate = false;
                match way {
                    Some(idx) => {
                        let state = self.tags[set][idx].state;
                        let state_l1 = self.tags[set][idx].state_l1;
                        if matches!(state, CohState::TrToS | CohState::TrToE | CohState::TrToI) {
                            panic!(
                                "{}: invalidate in transient state {:?}: {}",
                                self.id, state, msg
                            );
                        } else if state == CohState::Modified && state_l1 == CohState::Modified {
                            enter_intermediate = true;
                            assert_eq!(self.tags[set][idx].shared_l1.len(), 1);
                            let line = self.line_addr(set, idx);
                            let th_id = msg.th_id;
                            let owner =
                                *self.tags[set][idx].shared_l1.iter().next().expect("sharer");
                            let entry = &mut self.tags[set][idx];
                            entry.last_access_time = curr_time;
                            entry.state_l1 = CohState::TrToI;
                            entry.state = CohState::TrToI;
                            entry.pending = Some(msg.clone());
                            entry.shared_l1.clear();
                            let lqe = Message::new(self.id, MsgKind::MToM, line, th_id);
                            sink.rep(curr_time + self.to_l1_t, owner, lqe);
                        } else if state == CohState::Modified
                            && matches!(state_l1, CohState::TrToM | CohState::TrToS)
                        {
                            enter_intermediate = true;
                            assert!(self.tags[set][idx].pending.is_none());
                            self.tags[set][idx].last_access_time = curr_time;
                            self.tags[set][idx].state = CohState::TrToI;
                            self.tags[set][idx].pending = Some(msg.clone());
                        } else {
                            let line = self.line_addr(set, idx);
                            self.req_l1_evict(curr_time, set, idx, line, msg.th_id, None, sink);
                            self.stats.num_ev_coherency += 1;
                            self.destroy_line_stats(curr_time, set, idx);
                            self.tags[set][idx].state = CohState::Invalid;
                            self.tags[set][idx].state_l1 = CohState::Invalid;
                        }
                    }
                    None => {
                        msg.kind = MsgKind::InvalidateNd;
                    }
                }
                if !enter_intermediate {
                    let is_data = msg.kind == MsgKind::Invalidate;
                    self.send_to_ll(curr_time, msg, true, is_data, sink);
                }
            }

            MsgKind::Nop => {}

            _ => panic!("{}: unexpected reply {} at {}", self.id, msg, curr_time),
        }
    }

    fn process_request(&mut self, curr_time: u64, mut msg: Message, sink: &mut EventSink) {
        let address = msg.address;
        let set = self.geom.set_of(address);
        let tag = self.geom.tag_of(address);
        let etype = msg.kind;
        let mut hit = self.always_hit;
        let mut is_coherence_miss = false;
        let mut enter_intermediate = false;

        debug_assert!(
            matches!(etype, MsgKind::Read | MsgKind::Write),
            "{}: upstream request must be read or write: {}",
            self.id,
            msg
        );

        if etype == MsgKind::Read {
            self.stats.num_rd_access += 1;
            for idx in 0..self.tags[set].len() {
                let state = self.tags[set][idx].state;
                if state == CohState::Invalid || state == CohState::TrToE {
                    continue;
                }
                if self.tags[set][idx].tag != tag {
                    continue;
                }
                if msg.from.len() == 1 {
                    // Prefetch-originated probe: a plain hit, no sharer
                    // bookkeeping.
                    hit = true;
                    continue;
                }
                let state_l1 = self.tags[set][idx].state_l1;
                let requester = msg.top();
                if state_l1 == CohState::Invalid && state.is_stable_valid() {
                    self.tags[set][idx].state_l1 = CohState::Exclusive;
                    self.tags[set][idx].shared_l1.insert(requester);
                } else if state_l1 == CohState::Exclusive && state.is_stable_valid() {
                    self.tags[set][idx].shared_l1.insert(requester);
                    if self.tags[set][idx].shared_l1.len() > 1 {
                        self.tags[set][idx].state_l1 = CohState::Shared;
                    }
                } else if state_l1 == CohState::Shared && state.is_stable_valid() {
                    self.tags[set][idx].shared_l1.insert(requester);
                } else if state_l1 == CohState::Modified && state == CohState::Modified {
                    assert!(
                        self.tags[set][idx].shared_l1.len() <= 1,
                        "{}: modified line with multiple sharers",
                        self.id
                    );
                    if self.tags[set][idx].shared_l1.len() == 1 {
                        let owner = *self.tags[set][idx].shared_l1.iter().next().expect("sharer");
                        if owner != requester {
                            // Pull the dirty copy out of the other L1 first.
                            enter_intermediate = true;
                            msg.push(self.id);
                            msg.kind = MsgKind::MToS;
                            sink.rep(curr_time + self.to_l1_t, owner, msg.clone());
                            self.tags[set][idx].state_l1 = CohState::TrToS;
                            self.tags[set][idx].shared_l1.clear();
                            self.tags[set][idx].last_access_time = curr_time;
                            hit = true;
                            self.promote(set, idx);
                            break;
                        }
                    } else {
                        self.tags[set][idx].state_l1 = CohState::Shared;
                        self.tags[set][idx].shared_l1.insert(requester);
                    }
                } else if (state_l1 == CohState::Exclusive && state == CohState::TrToS)
                    || matches!(state_l1, CohState::TrToS | CohState::TrToM | CohState::TrToI)
                    || state == CohState::TrToM
                {
                    msg.kind = MsgKind::Nack;
                } else {
                    panic!(
                        "[{}] {}: read hit in bad state ({:?}, {:?}): {}",
                        curr_time, self.id, state, state_l1, msg
                    );
                }
                self.tags[set][idx].last_access_time = curr_time;
                hit = true;
                self.promote(set, idx);
                break;
            }
        } else {
            self.stats.num_wr_access += 1;
            for idx in 0..self.tags[set].len() {
                let state = self.tags[set][idx].state;
                if matches!(state, CohState::Exclusive | CohState::Shared) {
                    if self.tags[set][idx].tag != tag {
                        continue;
                    }
                    let requester = msg.top();
                    let sole_owner = state == CohState::Exclusive
                        && self.tags[set][idx].shared_l1.len() == 1
                        && self.tags[set][idx].shared_l1.iter().next() == Some(&requester);
                    if sole_owner {
                        // Upgrade in place; the directory confirms with
                        // write_nd while we sit in tr_to_m.
                        self.tags[set][idx].last_access_time = curr_time;
                        self.tags[set][idx].state = CohState::TrToM;
                    } else {
                        let line = self.line_addr(set, idx);
                        if !self.tags[set][idx].shared_l1.is_empty() {
                            self.tags[set][idx].last_access_time = curr_time;
                            self.tags[set][idx].state = CohState::Invalid;
                        }
                        self.req_l1_evict(
                            curr_time,
                            set,
                            idx,
                            line,
                            msg.th_id,
                            Some(requester),
                            sink,
                        );
                    }
                    self.stats.num_upgrade_req += 1;
                    is_coherence_miss = true;
                    break;
                }
                if state == CohState::Invalid || state == CohState::TrToE {
                    continue;
                }
                if self.tags[set][idx].tag != tag {
                    continue;
                }
                let state_l1 = self.tags[set][idx].state_l1;
                let requester = msg.top();
                if state == CohState::Modified && state_l1 == CohState::Invalid {
                    // Hit; the tail marks the line modified for this L1.
                } else if state == CohState::Modified && state_l1 == CohState::Modified {
                    assert_eq!(self.tags[set][idx].shared_l1.len(), 1);
                    let owner = *self.tags[set][idx].shared_l1.iter().next().expect("sharer");
                    if owner != requester {
                        enter_intermediate = true;
                        msg.push(self.id);
                        msg.kind = MsgKind::MToM;
                        sink.rep(curr_time + self.to_l1_t, owner, msg.clone());
                        self.tags[set][idx].state_l1 = CohState::TrToM;
                        self.tags[set][idx].shared_l1.clear();
                        self.tags[set][idx].last_access_time = curr_time;
                        hit = true;
                        self.promote(set, idx);
                        break;
                    }
                } else if state == CohState::Modified && state_l1 == CohState::Exclusive {
                    assert!(self.tags[set][idx].shared_l1.len() <= 1);
                    let other = self
                        .tags[set][idx]
                        .shared_l1
                        .iter()
                        .next()
                        .copied()
                        .filter(|&l1| l1 != requester);
                    if let Some(l1) = other {
                        let line = self.line_addr(set, idx);
                        let lqe = Message::new(self.id, MsgKind::Evict, line, msg.th_id);
                        sink.rep(curr_time + self.to_l1_t, l1, lqe);
                        self.tags[set][idx].shared_l1.clear();
                    }
                } else if state == CohState::Modified && state_l1 == CohState::Shared {
                    let line = self.line_addr(set, idx);
                    self.req_l1_evict(curr_time, set, idx, line, msg.th_id, Some(requester), sink);
                } else if (state_l1 == CohState::Exclusive && state == CohState::TrToS)
                    || matches!(state_l1, CohState::TrToS | CohState::TrToM | CohState::TrToI)
                    || state == CohState::TrToM
                {
                    self.tags[set][idx].last_access_time = curr_time;
                    msg.kind = MsgKind::Nack;
                    hit = true;
                    self.promote(set, idx);
                    break;
                } else {
                    panic!(
                        "[{}] {}: write hit in bad state ({:?}, {:?}): {}",
                        curr_time, self.id, state, state_l1, msg
                    );
                }
                self.tags[set][idx].last_access_time = curr_time;
                self.tags[set][idx].state_l1 = CohState::Modified;
                self.tags[set][idx].shared_l1.insert(requester);
                hit = true;
                self.promote(set, idx);
                break;
            }
        }

        if !enter_intermediate {
            if !hit {
                if !is_coherence_miss {
                    if etype == MsgKind::Write {
                        self.stats.num_wr_miss += 1;
                    } else {
                        self.stats.num_rd_miss += 1;
                    }
                }
                msg.push(self.id);
                if self.addr_map.which_mc(address) == self.directory.num {
                    sink.req(curr_time + self.to_dir_t, self.directory, msg);
                } else {
                    sink.req(curr_time + self.to_xbar_t, self.noc, msg);
                }
            } else if msg.from.len() > 1 {
                let l1 = msg.top();
                sink.rep(curr_time + self.to_l1_t, l1, msg);
            }
            // A prefetch-origin hit (bare stack) needs no reply.
        }
    }

    pub fn print_stats(&self) {
        let s = &self.stats;
        if s.num_rd_access > 0 {
            println!(
                "  -- L2$ [{:3}] : RD (miss, acc)=({:8}, {:8})= {:6.2}%",
                self.id.num,
                s.num_rd_miss,
                s.num_rd_access,
                100.0 * s.num_rd_miss as f64 / s.num_rd_access as f64
            );
        }
        if s.num_wr_access > 0 {
            println!(
                "  -- L2$ [{:3}] : WR (miss, acc)=({:8}, {:8})= {:6.2}%",
                self.id.num,
                s.num_wr_miss,
                s.num_wr_access,
                100.0 * s.num_wr_miss as f64 / s.num_wr_access as f64
            );
        }
        if s.num_ev_coherency > 0
            || s.num_ev_capacity > 0
            || s.num_coherency_access > 0
            || s.num_upgrade_req > 0
        {
            println!(
                "  -- L2$ [{:3}] : (ev_coherency, ev_capacity, coherency_acc, up_req, bypass, nack)=({:8}, {:8}, {:8}, {:8}, {:8}, {:8})",
                self.id.num,
                s.num_ev_coherency,
                s.num_ev_capacity,
                s.num_coherency_access,
                s.num_upgrade_req,
                s.num_bypass,
                s.num_nack
            );
        }
        if self.num_ev_from_l1 > 0 {
            println!(
                "  -- L2$ [{:3}] : EV_from_L1 (miss, acc)=({:8}, {:8})= {:.2}%",
                self.id.num,
                self.num_ev_from_l1_miss,
                self.num_ev_from_l1,
                100.0 * self.num_ev_from_l1_miss as f64 / self.num_ev_from_l1 as f64
            );
        }
        if self.display_life_time && self.num_destroyed_cache_lines > 0 {
            let denom = (self.process_interval * self.num_destroyed_cache_lines) as f64;
            println!(
                "  -- L2$ [{:3}] : (cache_line_life_time, time_between_last_access_and_cache_destroy) = ({:.2}, {:.2}) L2$ cycles",
                self.id.num,
                self.cache_line_life_time as f64 / denom,
                self.time_between_last_access_and_cache_destroy as f64 / denom
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSink;
    use crate::params::Params;

    fn l2() -> CacheL2 {
        let params = Params::new();
        let map = AddressMap::from_params(&params);
        CacheL2::new(0, &params, map)
    }

    fn upstream_read(l1: CompId, addr: u64) -> Message {
        let core = CompId::new(CompKind::O3Core, 0);
        let mut m = Message::new(core, MsgKind::Read, addr, 0);
        m.push(l1);
        m
    }

    #[test]
    fn local_miss_goes_to_directory_remote_to_noc() {
        let mut c = l2();
        let mut sink = EventSink::new();
        let l1 = CompId::new(CompKind::CacheL1D, 0);

        // which_mc(0) == 0 == this tile.
        c.add_req_event(0, upstream_read(l1, 0x0), &mut sink);
        c.process_event(0, &mut sink);
        assert_eq!(sink.sends.pop_back().unwrap().dest, c.directory);

        // Bit 12 set -> home mc 1 -> remote.
        let mut sink = EventSink::new();
        c.add_req_event(20, upstream_read(l1, 1 << 12), &mut sink);
        c.process_event(20, &mut sink);
        assert_eq!(sink.sends.pop_back().unwrap().dest, c.noc);
    }

    #[test]
    fn exclusive_data_reply_installs_and_forwards() {
        let mut c = l2();
        let mut sink = EventSink::new();
        let l1 = CompId::new(CompKind::CacheL1D, 0);

        let mut rep = upstream_read(l1, 0x26C8);
        rep.kind = MsgKind::ERd;
        rep.push(c.id);
        c.add_rep_event(0, rep, &mut sink);
        c.process_event(0, &mut sink);

        assert_eq!(
            c.line_states(0x26C8),
            Some((CohState::Exclusive, CohState::Exclusive))
        );
        assert_eq!(c.sharer_count(0x26C8), 1);
        let send = sink.sends.pop_back().unwrap();
        assert_eq!(send.dest, l1);
        assert_eq!(send.msg.kind, MsgKind::Read);
    }

    #[test]
    fn second_l1_read_hit_moves_l1_state_to_shared() {
        let mut c = l2();
        let mut sink = EventSink::new();
        let l1a = CompId::new(CompKind::CacheL1D, 0);
        let l1b = CompId::new(CompKind::CacheL1D, 1);

        let mut rep = upstream_read(l1a, 0x26C8);
        rep.kind = MsgKind::ERd;
        rep.push(c.id);
        c.add_rep_event(0, rep, &mut sink);
        c.process_event(0, &mut sink);

        c.add_req_event(20, upstream_read(l1b, 0x26C8), &mut sink);
        c.process_event(20, &mut sink);

        assert_eq!(
            c.line_states(0x26C8),
            Some((CohState::Exclusive, CohState::Shared))
        );
        assert_eq!(c.sharer_count(0x26C8), 2);
    }

    #[test]
    fn write_upgrade_from_sole_exclusive_enters_tr_to_m() {
        let mut c = l2();
        let mut sink = EventSink::new();
        let l1 = CompId::new(CompKind::CacheL1D, 0);

        let mut rep = upstream_read(l1, 0x40);
        rep.kind = MsgKind::ERd;
        rep.push(c.id);
        c.add_rep_event(0, rep, &mut sink);
        c.process_event(0, &mut sink);

        let core = CompId::new(CompKind::O3Core, 0);
        let mut wr = Message::new(core, MsgKind::Write, 0x40, 0);
        wr.push(l1);
        c.add_req_event(20, wr, &mut sink);
        c.process_event(20, &mut sink);

        assert_eq!(
            c.line_states(0x40).map(|(t, _)| t),
            Some(CohState::TrToM)
        );
        // The upgrade request itself travels to the directory.
        assert!(sink
            .sends
            .iter()
            .any(|s| s.dest == c.directory && s.msg.kind == MsgKind::Write));
    }

    #[test]
    fn invalidate_without_line_answers_nd() {
        let mut c = l2();
        let mut sink = EventSink::new();
        let dir = CompId::new(CompKind::Directory, 0);

        let inv = Message::new(dir, MsgKind::Invalidate, 0x80, 0);
        c.add_rep_event(0, inv, &mut sink);
        c.process_event(0, &mut sink);

        let send = sink.sends.pop_back().unwrap();
        assert_eq!(send.msg.kind, MsgKind::InvalidateNd);
        assert_eq!(send.dest, c.directory);
    }
}
