/*!
Ring interconnect with shortest-direction routing.

Every node carries a clockwise port, a counter-clockwise port, and one
attachment port per L2 / memory controller placed there (`l2_posN` /
`mc_posN` parameters). Port arrays are sized by the largest radix any node
reaches. A message travels the direction with fewer hops; ties go
clockwise. One message per port per tick, token-rotated scan order.
*/

use std::collections::{BTreeMap, VecDeque};

use crate::event::{EventSink, Port};
use crate::message::{AddressMap, CompId, CompKind, Message};
use crate::noc::{rep_goes_to_directory, NocPriority, NocStats};
use crate::params::{ceil_by, Params, Scoped};

const RING_CW: usize = 0;
const RING_CCW: usize = 1;

type HopQueue = BTreeMap<u64, VecDeque<(Message, CompId)>>;

pub struct Ring {
    pub id: CompId,
    pub process_interval: u64,
    sw_to_sw_t: u64,
    num_nodes: u32,
    addr_map: AddressMap,

    l2_pos: Vec<u32>,
    l2_port_num: Vec<usize>,
    mc_pos: Vec<u32>,
    mc_port_num: Vec<usize>,

    pub directory: Vec<CompId>,
    pub cachel2: Vec<CompId>,

    /// [node][port], entries keyed by the tick they become movable.
    req_qs: Vec<Vec<HopQueue>>,
    crq_qs: Vec<Vec<HopQueue>>,
    rep_qs: Vec<Vec<HopQueue>>,
    already_sent: Vec<bool>,
    num_in_flight: u64,
    token: usize,

    pub stats: NocStats,
}

impl Ring {
    pub fn new(params: &Params, num_l2s: u32, addr_map: AddressMap) -> Self {
        let p = Scoped::new(params, "pts.ring.");
        let num_nodes = p.u64("num_nodes", 4) as u32;
        let num_mcs = params.get_u64("pts.num_mcs", 2) as u32;

        // Radix per node grows with each attachment; ports 0/1 are the ring
        // links themselves.
        let mut router_radix = vec![2usize; num_nodes as usize];
        let mut mc_pos = Vec::new();
        let mut mc_port_num = Vec::new();
        for i in 0..num_mcs {
            let pos = p.u64(&format!("mc_pos{i}"), 0) as u32;
            assert!(pos < num_nodes, "mc_pos{i} outside the {num_nodes}-node ring");
            mc_pos.push(pos);
            mc_port_num.push(router_radix[pos as usize]);
            router_radix[pos as usize] += 1;
        }
        let mut l2_pos = Vec::new();
        let mut l2_port_num = Vec::new();
        for i in 0..num_l2s {
            let pos = p.u64(&format!("l2_pos{i}"), 0) as u32;
            assert!(pos < num_nodes, "l2_pos{i} outside the {num_nodes}-node ring");
            l2_pos.push(pos);
            l2_port_num.push(router_radix[pos as usize]);
            router_radix[pos as usize] += 1;
        }
        let max_radix = router_radix.iter().copied().max().unwrap_or(2);

        let make_qs = || -> Vec<Vec<HopQueue>> {
            (0..num_nodes)
                .map(|_| (0..max_radix).map(|_| HopQueue::new()).collect())
                .collect()
        };

        Self {
            id: CompId::new(CompKind::Noc, 0),
            process_interval: p.u64("process_interval", 10),
            sw_to_sw_t: p.u64("sw_to_sw_t", 10),
            num_nodes,
            addr_map,
            l2_pos,
            l2_port_num,
            mc_pos,
            mc_port_num,
            directory: Vec::new(),
            cachel2: Vec::new(),
            req_qs: make_qs(),
            crq_qs: make_qs(),
            rep_qs: make_qs(),
            already_sent: vec![false; max_radix],
            num_in_flight: 0,
            token: 0,
            stats: NocStats::default(),
        }
    }

    fn aligned(&self, time: u64) -> u64 {
        ceil_by(time, self.process_interval)
    }

    pub fn add_req_event(&mut self, time: u64, msg: Message, from: CompId, sink: &mut EventSink) {
        let time = self.aligned(time);
        sink.wake(time, self.id);
        let node = self.l2_pos[from.num as usize] as usize;
        let port = self.l2_port_num[from.num as usize];
        self.req_qs[node][port]
            .entry(time)
            .or_default()
            .push_back((msg, from));
        self.num_in_flight += 1;
        self.stats.num_req += 1;
        self.stats.num_flits += 1;
    }

    pub fn add_crq_event(&mut self, time: u64, msg: Message, from: CompId, sink: &mut EventSink) {
        let time = self.aligned(time);
        sink.wake(time, self.id);
        let node = self.mc_pos[from.num as usize] as usize;
        let port = self.mc_port_num[from.num as usize];
        self.crq_qs[node][port]
            .entry(time)
            .or_default()
            .push_back((msg, from));
        self.num_in_flight += 1;
        self.stats.num_crq += 1;
        self.stats.num_flits += 1;
    }

    pub fn add_rep_event(&mut self, time: u64, msg: Message, from: CompId, sink: &mut EventSink) {
        let time = self.aligned(time);
        sink.wake(time, self.id);
        let (node, port) = if rep_goes_to_directory(&msg, from) {
            (
                self.l2_pos[from.num as usize] as usize,
                self.l2_port_num[from.num as usize],
            )
        } else {
            (
                self.mc_pos[from.num as usize] as usize,
                self.mc_port_num[from.num as usize],
            )
        };
        self.rep_qs[node][port]
            .entry(time)
            .or_default()
            .push_back((msg, from));
        self.num_in_flight += 1;
        self.stats.num_rep += 1;
        self.stats.num_flits += 1;
    }

    pub fn mailboxes_empty(&self) -> bool {
        self.num_in_flight == 0
    }

    pub fn process_event(&mut self, curr_time: u64, sink: &mut EventSink) {
        let num_ports = self.already_sent.len();
        for node in 0..self.num_nodes as usize {
            for sent in self.already_sent.iter_mut() {
                *sent = false;
            }
            for prio in [NocPriority::Rep, NocPriority::Crq, NocPriority::Req] {
                for k in 0..num_ports {
                    let dir = (k + self.token) % num_ports;
                    self.process_qs(prio, node, dir, curr_time, sink);
                }
            }
        }

        if self.num_in_flight > 0 {
            sink.wake(curr_time + self.process_interval, self.id);
        }
        self.token = (self.token + 1) % num_ports;
    }

    fn process_qs(
        &mut self,
        prio: NocPriority,
        node: usize,
        dir: usize,
        curr_time: u64,
        sink: &mut EventSink,
    ) {
        let qs = match prio {
            NocPriority::Rep => &self.rep_qs,
            NocPriority::Crq => &self.crq_qs,
            NocPriority::Req => &self.req_qs,
        };
        let Some((&t, bucket)) = qs[node][dir].iter().next() else {
            return;
        };
        if t > curr_time || bucket.is_empty() {
            return;
        }
        let (msg, from) = bucket.front().expect("bucket non-empty").clone();

        // The L2 target is read off the stack here: for crq traffic the
        // duplicated hop is popped at delivery.
        let (target_pos, target_port, to_dir, to_l2) = match prio {
            NocPriority::Rep => {
                if rep_goes_to_directory(&msg, from) {
                    let which = self.addr_map.which_mc(msg.address) as usize;
                    (
                        self.mc_pos[which] as usize,
                        self.mc_port_num[which],
                        Some(self.directory[which]),
                        None,
                    )
                } else {
                    let cluster = msg.top().num as usize;
                    (
                        self.l2_pos[cluster] as usize,
                        self.l2_port_num[cluster],
                        None,
                        Some(self.cachel2[cluster]),
                    )
                }
            }
            NocPriority::Crq => {
                let cluster = msg.top().num as usize;
                (
                    self.l2_pos[cluster] as usize,
                    self.l2_port_num[cluster],
                    None,
                    Some(self.cachel2[cluster]),
                )
            }
            NocPriority::Req => {
                let which = self.addr_map.which_mc(msg.address) as usize;
                (
                    self.mc_pos[which] as usize,
                    self.mc_port_num[which],
                    Some(self.directory[which]),
                    None,
                )
            }
        };

        let n = self.num_nodes as usize;
        let clockwise_dist = (n + target_pos - node) % n;
        if target_pos != node && clockwise_dist <= n / 2 {
            // Clockwise is the short way (ties included).
            if self.already_sent[RING_CW] {
                return;
            }
            self.already_sent[RING_CW] = true;
            let entry = self.pop_entry(prio, node, dir);
            let next = (node + 1) % n;
            let arrival = curr_time + self.sw_to_sw_t;
            self.queue_mut(prio)[next][RING_CCW]
                .entry(arrival)
                .or_default()
                .push_back(entry);
            self.stats.num_hops += 1;
        } else if target_pos != node {
            if self.already_sent[RING_CCW] {
                return;
            }
            self.already_sent[RING_CCW] = true;
            let entry = self.pop_entry(prio, node, dir);
            let next = (n + node - 1) % n;
            let arrival = curr_time + self.sw_to_sw_t;
            self.queue_mut(prio)[next][RING_CW]
                .entry(arrival)
                .or_default()
                .push_back(entry);
            self.stats.num_hops += 1;
        } else {
            if self.already_sent[target_port] {
                return;
            }
            self.already_sent[target_port] = true;
            let (mut msg, _from) = self.pop_entry(prio, node, dir);
            if prio == NocPriority::Crq {
                msg.pop();
            }
            self.num_in_flight -= 1;
            self.stats.num_hops += 1;
            if msg.dummy {
                return;
            }
            match (to_dir, to_l2) {
                (Some(dir_id), _) => {
                    let port = if prio == NocPriority::Req {
                        Port::Req
                    } else {
                        Port::Rep
                    };
                    sink.send(curr_time + self.sw_to_sw_t, dir_id, port, msg);
                }
                (None, Some(l2)) => {
                    sink.rep(curr_time + self.sw_to_sw_t, l2, msg);
                }
                (None, None) => unreachable!(),
            }
        }
    }

    fn queue_mut(&mut self, prio: NocPriority) -> &mut Vec<Vec<HopQueue>> {
        match prio {
            NocPriority::Rep => &mut self.rep_qs,
            NocPriority::Crq => &mut self.crq_qs,
            NocPriority::Req => &mut self.req_qs,
        }
    }

    fn pop_entry(&mut self, prio: NocPriority, node: usize, dir: usize) -> (Message, CompId) {
        let qs = self.queue_mut(prio);
        let (&t, _) = qs[node][dir].iter().next().expect("entry present");
        let bucket = qs[node][dir].get_mut(&t).expect("bucket present");
        let entry = bucket.pop_front().expect("entry present");
        if bucket.is_empty() {
            qs[node][dir].remove(&t);
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgKind;

    fn ring() -> Ring {
        let mut params = Params::new();
        params.set_u64("pts.ring.num_nodes", 4);
        params.set_u64("pts.num_mcs", 2);
        params.set_u64("pts.ring.mc_pos0", 0);
        params.set_u64("pts.ring.mc_pos1", 2);
        params.set_u64("pts.ring.l2_pos0", 1);
        params.set_u64("pts.ring.l2_pos1", 3);
        let map = AddressMap::from_params(&params);
        let mut r = Ring::new(&params, 2, map);
        r.directory = (0..2).map(|i| CompId::new(CompKind::Directory, i)).collect();
        r.cachel2 = (0..2).map(|i| CompId::new(CompKind::CacheL2, i)).collect();
        r
    }

    fn run(r: &mut Ring, mut time: u64, limit: u64) -> Vec<crate::event::Send> {
        let mut out = Vec::new();
        while time < limit {
            let mut sink = EventSink::new();
            r.process_event(time, &mut sink);
            out.extend(sink.sends);
            if r.mailboxes_empty() {
                break;
            }
            time += r.process_interval;
        }
        out
    }

    #[test]
    fn request_reaches_home_directory_by_shortest_path() {
        let mut r = ring();
        let l2 = CompId::new(CompKind::CacheL2, 0); // node 1
        let mut msg = Message::new(CompId::new(CompKind::CacheL1D, 0), MsgKind::Read, 0, 0);
        msg.push(l2);

        let mut sink = EventSink::new();
        // Home mc 0 sits at node 0: one counter-clockwise hop from node 1.
        r.add_req_event(0, msg, l2, &mut sink);
        let sends = run(&mut r, 0, 1000);

        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].dest, CompId::new(CompKind::Directory, 0));
    }

    #[test]
    fn reply_reaches_requesting_l2() {
        let mut r = ring();
        let dir = CompId::new(CompKind::Directory, 1); // node 2
        let target = CompId::new(CompKind::CacheL2, 1); // node 3
        let mut msg = Message::bare(MsgKind::SRd, 1 << 12, 0);
        msg.push(target);

        let mut sink = EventSink::new();
        r.add_rep_event(0, msg, dir, &mut sink);
        let sends = run(&mut r, 0, 1000);

        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].dest, target);
    }
}
