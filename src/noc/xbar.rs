/*!
Crossbar interconnect.

Every endpoint (one per tile: its L2 and directory share a port number) has
a queue per priority. Each tick the crossbar attempts two sends per port,
walking the ports from a rotating starting index, alternating clockwise and
counter-clockwise between ticks; a destination accepts at most one message
per tick. Replies drain before coherence requests before requests.
*/

use std::collections::{BTreeMap, VecDeque};

use crate::event::{EventSink, Port};
use crate::message::{AddressMap, CompId, CompKind, Message};
use crate::noc::{rep_goes_to_directory, NocPriority, NocStats};
use crate::params::{ceil_by, Params, Scoped};

type Arrival = (Message, CompId);

pub struct Crossbar {
    pub id: CompId,
    pub process_interval: u64,
    to_dir_t: u64,
    num_ports: u32,
    addr_map: AddressMap,

    pub directory: Vec<CompId>,
    pub cachel2: Vec<CompId>,

    req_events: BTreeMap<u64, VecDeque<Arrival>>,
    crq_events: BTreeMap<u64, VecDeque<Arrival>>,
    rep_events: BTreeMap<u64, VecDeque<Arrival>>,
    /// queues[port][priority] holds (message, destination).
    queues: Vec<[VecDeque<(Message, CompId)>; 3]>,
    already_sent: Vec<bool>,

    // Fairness token.
    clockwise: bool,
    top_priority: u32,

    pub stats: NocStats,
}

impl Crossbar {
    pub fn new(params: &Params, num_ports: u32, addr_map: AddressMap) -> Self {
        let p = Scoped::new(params, "pts.xbar.");
        Self {
            id: CompId::new(CompKind::Noc, 0),
            process_interval: p.u64("process_interval", 10),
            to_dir_t: p.u64("to_dir_t", 90),
            num_ports,
            addr_map,
            directory: Vec::new(),
            cachel2: Vec::new(),
            req_events: BTreeMap::new(),
            crq_events: BTreeMap::new(),
            rep_events: BTreeMap::new(),
            queues: (0..num_ports)
                .map(|_| [VecDeque::new(), VecDeque::new(), VecDeque::new()])
                .collect(),
            already_sent: vec![false; num_ports as usize],
            clockwise: true,
            top_priority: 0,
            stats: NocStats::default(),
        }
    }

    fn aligned(&self, time: u64) -> u64 {
        ceil_by(time, self.process_interval)
    }

    pub fn add_req_event(&mut self, time: u64, msg: Message, from: CompId, sink: &mut EventSink) {
        let time = self.aligned(time);
        self.stats.num_req += 1;
        self.stats.num_flits += 1;
        sink.wake(time, self.id);
        self.req_events.entry(time).or_default().push_back((msg, from));
    }

    pub fn add_crq_event(&mut self, time: u64, msg: Message, from: CompId, sink: &mut EventSink) {
        let time = self.aligned(time);
        self.stats.num_crq += 1;
        self.stats.num_flits += 1;
        sink.wake(time, self.id);
        self.crq_events.entry(time).or_default().push_back((msg, from));
    }

    pub fn add_rep_event(&mut self, time: u64, msg: Message, from: CompId, sink: &mut EventSink) {
        let time = self.aligned(time);
        self.stats.num_rep += 1;
        self.stats.num_flits += 1;
        sink.wake(time, self.id);
        self.rep_events.entry(time).or_default().push_back((msg, from));
    }

    pub fn mailboxes_empty(&self) -> bool {
        self.req_events.is_empty()
            && self.crq_events.is_empty()
            && self.rep_events.is_empty()
            && self.queues.iter().all(|q| q.iter().all(VecDeque::is_empty))
    }

    pub fn process_event(&mut self, curr_time: u64, sink: &mut EventSink) {
        // Move this tick's arrivals into the port queues.
        if let Some(arrivals) = self.rep_events.remove(&curr_time) {
            for (msg, from) in arrivals {
                let dest = if rep_goes_to_directory(&msg, from) {
                    self.directory[self.addr_map.which_mc(msg.address) as usize]
                } else {
                    msg.top()
                };
                self.queues[from.num as usize][NocPriority::Rep as usize]
                    .push_back((msg, dest));
            }
        }
        if let Some(arrivals) = self.crq_events.remove(&curr_time) {
            for (mut msg, from) in arrivals {
                // The target L2 rides on top of the back-stack.
                let dest = msg.pop();
                self.queues[from.num as usize][NocPriority::Crq as usize]
                    .push_back((msg, dest));
            }
        }
        if let Some(arrivals) = self.req_events.remove(&curr_time) {
            for (msg, from) in arrivals {
                let dest = self.directory[self.addr_map.which_mc(msg.address) as usize];
                self.queues[from.num as usize][NocPriority::Req as usize]
                    .push_back((msg, dest));
            }
        }

        for sent in self.already_sent.iter_mut() {
            *sent = false;
        }

        // Two send attempts per port, rotating the starting port and the
        // scan direction across ticks.
        for i in 0..self.num_ports {
            let idx = if self.clockwise {
                (self.top_priority + self.num_ports + i) % self.num_ports
            } else {
                (self.top_priority + self.num_ports - i) % self.num_ports
            } as usize;

            let mut sent_this_port = 0;
            let mut skipped_first = false;
            while sent_this_port < 2 {
                let Some((prio, pos)) = self.head_of(idx, skipped_first) else {
                    break;
                };
                let dest_num = self.queues[idx][prio as usize][pos].1.num as usize;
                if self.already_sent[dest_num] {
                    if skipped_first {
                        break;
                    }
                    skipped_first = true;
                    continue;
                }
                self.already_sent[dest_num] = true;
                let (msg, dest) = self.queues[idx][prio as usize]
                    .remove(pos)
                    .expect("entry present");
                self.deliver(curr_time, prio, msg, dest, sink);
                sent_this_port += 1;
                skipped_first = false;
            }
        }

        if self.clockwise {
            self.clockwise = false;
        } else {
            self.clockwise = true;
            self.top_priority = (self.top_priority + 1) % self.num_ports;
        }

        if self.queues.iter().any(|q| q.iter().any(|v| !v.is_empty())) {
            sink.wake(curr_time + self.process_interval, self.id);
        }
    }

    /// First occupied (priority, position) on a port, optionally skipping
    /// the head entry (whose destination is blocked this tick).
    fn head_of(&self, port: usize, skip_head: bool) -> Option<(NocPriority, usize)> {
        let mut seen = 0usize;
        for prio in [NocPriority::Rep, NocPriority::Crq, NocPriority::Req] {
            let q = &self.queues[port][prio as usize];
            for pos in 0..q.len() {
                if skip_head && seen == 0 {
                    seen += 1;
                    continue;
                }
                return Some((prio, pos));
            }
            seen += q.len();
        }
        None
    }

    fn deliver(
        &mut self,
        curr_time: u64,
        prio: NocPriority,
        msg: Message,
        dest: CompId,
        sink: &mut EventSink,
    ) {
        if msg.dummy {
            // Padding flit: consumed a departure slot, dies here.
            return;
        }
        let port = if prio == NocPriority::Req {
            Port::Req
        } else {
            Port::Rep
        };
        sink.send(curr_time + self.to_dir_t, dest, port, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgKind;

    fn xbar() -> Crossbar {
        let params = Params::new();
        let map = AddressMap::from_params(&params);
        let mut x = Crossbar::new(&params, 2, map);
        x.directory = vec![
            CompId::new(CompKind::Directory, 0),
            CompId::new(CompKind::Directory, 1),
        ];
        x.cachel2 = vec![
            CompId::new(CompKind::CacheL2, 0),
            CompId::new(CompKind::CacheL2, 1),
        ];
        x
    }

    #[test]
    fn requests_route_to_home_directory() {
        let mut x = xbar();
        let mut sink = EventSink::new();
        let l2 = CompId::new(CompKind::CacheL2, 0);

        // Address with bit 12 set homes at mc 1.
        let mut msg = Message::new(CompId::new(CompKind::CacheL1D, 0), MsgKind::Read, 1 << 12, 0);
        msg.push(l2);
        x.add_req_event(0, msg, l2, &mut sink);
        x.process_event(0, &mut sink);

        let send = sink.sends.pop_back().unwrap();
        assert_eq!(send.dest, CompId::new(CompKind::Directory, 1));
        assert_eq!(send.port, Port::Req);
    }

    #[test]
    fn crq_pops_target_from_stack() {
        let mut x = xbar();
        let mut sink = EventSink::new();
        let dir = CompId::new(CompKind::Directory, 0);
        let target = CompId::new(CompKind::CacheL2, 1);

        let mut msg = Message::bare(MsgKind::EToS, 0x40, 0);
        msg.push(dir);
        msg.push(target);
        x.add_crq_event(0, msg, dir, &mut sink);
        x.process_event(0, &mut sink);

        let send = sink.sends.pop_back().unwrap();
        assert_eq!(send.dest, target);
        // The duplicate target hop was popped; the directory remains.
        assert_eq!(send.msg.top(), dir);
    }

    #[test]
    fn dummy_flits_are_destroyed_not_delivered() {
        let mut x = xbar();
        let mut sink = EventSink::new();
        let dir = CompId::new(CompKind::Directory, 0);
        let target = CompId::new(CompKind::CacheL2, 1);

        let mut dummy = Message::bare(MsgKind::SRd, 0x40, 0);
        dummy.push(target);
        dummy.dummy = true;
        let mut real = Message::bare(MsgKind::SRd, 0x40, 0);
        real.push(target);

        x.add_rep_event(0, dummy, dir, &mut sink);
        x.add_rep_event(0, real, dir, &mut sink);
        x.process_event(0, &mut sink);

        // Only the real flit reaches the L2.
        assert_eq!(sink.sends.len(), 1);
        assert!(!sink.sends[0].msg.dummy);
    }

    #[test]
    fn one_message_per_destination_per_tick() {
        let mut x = xbar();
        let mut sink = EventSink::new();
        let l2a = CompId::new(CompKind::CacheL2, 0);
        let l2b = CompId::new(CompKind::CacheL2, 1);

        // Two requests from different ports to the same home directory.
        let m1 = Message::new(CompId::new(CompKind::CacheL1D, 0), MsgKind::Read, 0, 0);
        let m2 = Message::new(CompId::new(CompKind::CacheL1D, 1), MsgKind::Read, 0x40, 0);
        x.add_req_event(0, m1, l2a, &mut sink);
        x.add_req_event(0, m2, l2b, &mut sink);
        x.process_event(0, &mut sink);

        assert_eq!(sink.sends.len(), 1, "destination accepts one per tick");
        // The loser departs on a later tick.
        let mut sink2 = EventSink::new();
        x.process_event(x.process_interval, &mut sink2);
        assert_eq!(sink2.sends.len(), 1);
    }
}
