/*!
L1 translation lookaside buffer: fully associative, LRU by last access
time.

A hit answers after `to_lsu_t`; a miss adds `miss_penalty` and installs the
page, evicting the entry with the oldest access time. `speedup` lookups are
served per tick. The I-side answers the core on its request port, the
D-side on its reply port.
*/

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::event::{EventSink, Mailbox, Port};
use crate::message::{CompId, CompKind, Message};
use crate::params::{Params, Scoped};

pub struct TlbL1 {
    pub id: CompId,
    pub process_interval: u64,
    num_entries: usize,
    to_lsu_t: u64,
    page_sz_log2: u32,
    miss_penalty: u64,
    speedup: u32,

    /// page number -> last access time.
    entries: BTreeMap<u64, u64>,
    /// (last access time, page number), oldest first.
    lru: BTreeSet<(u64, u64)>,

    req_event: Mailbox,
    req_q: VecDeque<Message>,

    pub num_access: u64,
    pub num_miss: u64,
}

impl TlbL1 {
    pub fn new(kind: CompKind, num: u32, params: &Params) -> Self {
        debug_assert!(matches!(kind, CompKind::TlbL1D | CompKind::TlbL1I));
        let p = Scoped::new(params, kind.prefix());
        Self {
            id: CompId::new(kind, num),
            process_interval: p.u64("process_interval", 10),
            num_entries: p.u64("num_entries", 64) as usize,
            to_lsu_t: p.u64("to_lsu_t", 0),
            page_sz_log2: p.u64("page_sz_log2", 13) as u32,
            miss_penalty: p.u64("miss_penalty", 100),
            speedup: p.u64("speedup", 1) as u32,
            entries: BTreeMap::new(),
            lru: BTreeSet::new(),
            req_event: Mailbox::default(),
            req_q: VecDeque::new(),
            num_access: 0,
            num_miss: 0,
        }
    }

    pub fn add_req_event(&mut self, event_time: u64, msg: Message, sink: &mut EventSink) {
        sink.wake(event_time, self.id);
        self.req_event.insert(event_time, msg);
    }

    pub fn mailboxes_empty(&self) -> bool {
        self.req_event.is_empty() && self.req_q.is_empty()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn contains_page(&self, page_num: u64) -> bool {
        self.entries.contains_key(&page_num)
    }

    pub fn process_event(&mut self, curr_time: u64, sink: &mut EventSink) {
        for m in self.req_event.drain_at(curr_time) {
            self.req_q.push_back(m);
        }

        for _ in 0..self.speedup {
            let Some(msg) = self.req_q.pop_front() else {
                break;
            };
            let page_num = msg.address >> self.page_sz_log2;
            self.num_access += 1;

            let delay = if let Some(&last) = self.entries.get(&page_num) {
                self.lru.remove(&(last, page_num));
                self.entries.insert(page_num, curr_time);
                self.lru.insert((curr_time, page_num));
                self.to_lsu_t
            } else {
                self.num_miss += 1;
                if self.entries.len() >= self.num_entries {
                    let &(oldest_time, oldest_page) =
                        self.lru.iter().next().expect("lru tracks every entry");
                    self.lru.remove(&(oldest_time, oldest_page));
                    self.entries.remove(&oldest_page);
                }
                self.entries.insert(page_num, curr_time);
                self.lru.insert((curr_time, page_num));
                self.to_lsu_t + self.miss_penalty
            };

            // I-side translations return on the request port.
            let dest = msg.top();
            let port = if self.id.kind == CompKind::TlbL1I {
                Port::Req
            } else {
                Port::Rep
            };
            sink.send(curr_time + delay, dest, port, msg);
        }

        if !self.req_q.is_empty() {
            sink.wake(curr_time + self.process_interval, self.id);
        }
    }

    pub fn print_stats(&self) {
        if self.num_access > 0 {
            let which = if self.id.kind == CompKind::TlbL1D {
                "TLBD"
            } else {
                "TLBI"
            };
            println!(
                "  -- {}[{}] : (miss, access) = ({}, {}) = {:.2}%",
                which,
                self.id.num,
                self.num_miss,
                self.num_access,
                100.0 * self.num_miss as f64 / self.num_access as f64
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgKind;

    fn tlb(num_entries: u64) -> TlbL1 {
        let mut params = Params::new();
        params.set_u64("pts.l1dtlb.num_entries", num_entries);
        TlbL1::new(CompKind::TlbL1D, 0, &params)
    }

    fn access(t: &mut TlbL1, time: u64, page: u64) {
        let core = CompId::new(CompKind::O3Core, 0);
        let mut sink = EventSink::new();
        let msg = Message::new(core, MsgKind::TlbRd, page << 13, 0);
        t.add_req_event(time, msg, &mut sink);
        t.process_event(time, &mut sink);
    }

    #[test]
    fn miss_then_hit_latency() {
        let mut t = tlb(64);
        let core = CompId::new(CompKind::O3Core, 0);
        let mut sink = EventSink::new();

        let msg = Message::new(core, MsgKind::TlbRd, 0x4000, 0);
        t.add_req_event(0, msg, &mut sink);
        t.process_event(0, &mut sink);
        let first = sink.sends.pop_back().unwrap();
        assert_eq!(first.time, 100, "miss pays the penalty");
        assert_eq!(first.port, Port::Rep);

        let msg = Message::new(core, MsgKind::TlbRd, 0x4000, 0);
        t.add_req_event(10, msg, &mut sink);
        t.process_event(10, &mut sink);
        let second = sink.sends.pop_back().unwrap();
        assert_eq!(second.time, 10, "hit answers immediately at to_lsu_t=0");
        assert_eq!(t.num_miss, 1);
    }

    #[test]
    fn lru_evicts_oldest_by_access_time() {
        // 64-entry TLB: fill it, re-touch the first page, then install two
        // more. Size stays 64 and the victims are the next-oldest peers of
        // the re-touched page, never the page itself.
        let mut t = tlb(64);
        for page in 0..64u64 {
            access(&mut t, page * 10, page);
        }
        // Re-touch page 0; page 1 becomes the oldest.
        access(&mut t, 640, 0);
        // Two more distinct pages evict pages 1 and 2.
        access(&mut t, 650, 100);
        access(&mut t, 660, 101);

        assert_eq!(t.num_access, 67);
        assert_eq!(t.num_miss, 66);
        assert_eq!(t.size(), 64);
        assert!(t.contains_page(0), "re-touched page survives");
        assert!(!t.contains_page(1), "next-oldest peer evicted");
        assert!(!t.contains_page(2));
        assert!(t.contains_page(3));
    }
}
