/*!
The simulator facade: owns every component, wires them together with stable
ids, routes messages between them, and drives the global clock.

Control flow with the external front-end:
- `add_instruction` deposits one retired instruction and returns the number
  of free fetch-queue slots for that hardware thread (0 = back-pressure);
- `resume_simulation` pops events until a core asks for more instructions,
  returning `(hthread, time)`; when the event queue drains while threads
  are still active, the first active thread's id is returned so the driver
  can feed it.

All cross-component traffic goes through `route`: a component's outgoing
sends are delivered into destination mailboxes after its `process_event`
returns, which is what makes state changes visible strictly after the tick
that produced them.
*/

use std::collections::BTreeMap;

use log::{debug, info};

use crate::cache::{CacheL1, CacheL2};
use crate::directory::Directory;
use crate::event::{EventSink, GlobalEventQueue, Port, Send};
use crate::mc::MemoryController;
use crate::message::{AddressMap, CompId, CompKind, MsgKind};
use crate::noc::{Crossbar, Mesh2D, Noc, Ring};
use crate::o3core::O3Core;
use crate::params::{ConfigError, Params};
use crate::tlb::TlbL1;

#[cfg(test)]
mod tests;

pub struct Machine {
    pub global_q: GlobalEventQueue,

    pub o3cores: Vec<O3Core>,
    pub l1is: Vec<CacheL1>,
    pub l1ds: Vec<CacheL1>,
    pub tlbl1is: Vec<TlbL1>,
    pub tlbl1ds: Vec<TlbL1>,
    pub l2s: Vec<CacheL2>,
    pub dirs: Vec<Directory>,
    pub mcs: Vec<MemoryController>,
    pub noc: Noc,

    addr_map: AddressMap,
    num_hthreads: u32,
    lsu_process_interval: u64,
    print_interval: u64,
    display_os_page_usage: bool,

    pub num_fetched_instrs: u64,
    os_page_req_dist: BTreeMap<u64, u64>,

    // Progress-report deltas.
    num_instrs_printed_last_time: u64,
    curr_time_last: u64,
    num_fetched_instrs_last: u64,
    num_l1_acc_last: u64,
    num_l1_miss_last: u64,
    num_l2_acc_last: u64,
    num_l2_miss_last: u64,
    num_mem_acc_last: u64,
    num_used_pages_last: u64,
}

impl Machine {
    pub fn new(params: &Params) -> Result<Self, ConfigError> {
        let num_hthreads = params.get_u64("pts.num_hthreads", 16) as u32;
        let num_threads_per_l1 = params.get_u64("pts.num_hthreads_per_l1$", 1) as u32;
        if num_threads_per_l1 != 1 {
            return Err(ConfigError::Invalid(
                "each hardware thread needs a private L1".into(),
            ));
        }
        let num_l1_per_l2 = params.get_u64("pts.num_l1$_per_l2$", 2) as u32;
        let num_mcs = params.get_u64("pts.num_mcs", 2) as u32;
        if num_mcs * num_l1_per_l2 > num_hthreads {
            return Err(ConfigError::Invalid(format!(
                "the number of memory controllers ({num_mcs}) must not exceed the number of L2 caches ({})",
                num_hthreads / num_l1_per_l2
            )));
        }
        let num_l2s = num_hthreads / num_l1_per_l2;
        let addr_map = AddressMap::from_params(params);

        let o3cores: Vec<O3Core> = (0..num_hthreads).map(|i| O3Core::new(i, params)).collect();
        let l1is: Vec<CacheL1> = (0..num_hthreads)
            .map(|i| CacheL1::new(CompKind::CacheL1I, i, params))
            .collect();
        let l1ds: Vec<CacheL1> = (0..num_hthreads)
            .map(|i| CacheL1::new(CompKind::CacheL1D, i, params))
            .collect();
        let tlbl1is: Vec<TlbL1> = (0..num_hthreads)
            .map(|i| TlbL1::new(CompKind::TlbL1I, i, params))
            .collect();
        let tlbl1ds: Vec<TlbL1> = (0..num_hthreads)
            .map(|i| TlbL1::new(CompKind::TlbL1D, i, params))
            .collect();
        let l2s: Vec<CacheL2> = (0..num_l2s)
            .map(|i| CacheL2::new(i, params, addr_map))
            .collect();
        let dirs: Vec<Directory> = (0..num_l2s)
            .map(|i| Directory::new(i, params, num_l2s as usize))
            .collect();
        let mcs: Vec<MemoryController> = (0..num_l2s)
            .map(|i| MemoryController::new(i, params, num_hthreads))
            .collect();

        let noc = match params.get_str("pts.noc_type") {
            "mesh" => Noc::Mesh(Mesh2D::new(params, addr_map)),
            "ring" => Noc::Ring(Ring::new(params, num_l2s, addr_map)),
            _ => Noc::Xbar(Crossbar::new(params, num_l2s, addr_map)),
        };

        let mut machine = Self {
            global_q: GlobalEventQueue::new(),
            o3cores,
            l1is,
            l1ds,
            tlbl1is,
            tlbl1ds,
            l2s,
            dirs,
            mcs,
            noc,
            addr_map,
            num_hthreads,
            lsu_process_interval: params.get_u64("pts.o3core.process_interval", 10),
            print_interval: params.get_u64("pts.print_interval", 1_000_000),
            display_os_page_usage: params.get_bool("pts.mc.display_os_page_usage", false),
            num_fetched_instrs: 0,
            os_page_req_dist: BTreeMap::new(),
            num_instrs_printed_last_time: 0,
            curr_time_last: 0,
            num_fetched_instrs_last: 0,
            num_l1_acc_last: 0,
            num_l1_miss_last: 0,
            num_l2_acc_last: 0,
            num_l2_miss_last: 0,
            num_mem_acc_last: 0,
            num_used_pages_last: 0,
        };
        machine.connect(num_l1_per_l2);

        // Kick off the refresh engines where configured.
        let mut sink = EventSink::new();
        for mc in &machine.mcs {
            mc.schedule_refresh(&mut sink);
        }
        for (t, comp) in sink.wakeups.drain(..) {
            machine.global_q.add_event(t, comp);
        }
        Ok(machine)
    }

    /// Wire the per-class vectors together with stable ids.
    fn connect(&mut self, num_l1_per_l2: u32) {
        let noc_id = self.noc.id();
        for i in 0..self.o3cores.len() as u32 {
            let core = &mut self.o3cores[i as usize];
            core.cachel1i = CompId::new(CompKind::CacheL1I, i);
            core.cachel1d = CompId::new(CompKind::CacheL1D, i);
            core.tlbl1i = CompId::new(CompKind::TlbL1I, i);
            core.tlbl1d = CompId::new(CompKind::TlbL1D, i);

            let l2 = CompId::new(CompKind::CacheL2, i / num_l1_per_l2);
            self.l1is[i as usize].core = CompId::new(CompKind::O3Core, i);
            self.l1is[i as usize].cachel2 = l2;
            self.l1ds[i as usize].core = CompId::new(CompKind::O3Core, i);
            self.l1ds[i as usize].cachel2 = l2;
        }

        let mut dir_ids = Vec::new();
        let mut l2_ids = Vec::new();
        for i in 0..self.l2s.len() as u32 {
            let dir = CompId::new(CompKind::Directory, i);
            let l2 = CompId::new(CompKind::CacheL2, i);
            let mc = CompId::new(CompKind::MemoryController, i);
            self.l2s[i as usize].directory = dir;
            self.l2s[i as usize].noc = noc_id;
            self.dirs[i as usize].cachel2 = l2;
            self.dirs[i as usize].mc = mc;
            self.dirs[i as usize].noc = noc_id;
            self.mcs[i as usize].directory = dir;
            dir_ids.push(dir);
            l2_ids.push(l2);
        }
        for dir in &mut self.dirs {
            dir.all_l2s = l2_ids.clone();
        }
        self.noc.connect(dir_ids, l2_ids);
    }

    pub fn num_hthreads(&self) -> u32 {
        self.num_hthreads
    }

    pub fn current_time(&self) -> u64 {
        self.global_q.curr_time
    }

    /// Deposit one retired instruction from the front-end. Returns the
    /// number of free fetch-queue slots for the thread (0 = stop feeding).
    #[allow(clippy::too_many_arguments)]
    pub fn add_instruction(
        &mut self,
        hthread_id: u32,
        curr_time: u64,
        waddr: u64,
        _wlen: u32,
        raddr: u64,
        raddr2: u64,
        _rlen: u32,
        ip: u64,
        category: u32,
        isbranch: bool,
        isbranchtaken: bool,
        islock: bool,
        isunlock: bool,
        isbarrier: bool,
        rr: [u32; 4],
        rw: [u32; 4],
    ) -> u32 {
        self.num_fetched_instrs += 1;
        let core = &mut self.o3cores[hthread_id as usize];
        if core.o3queue_size == 0 && core.resume_time <= curr_time {
            self.global_q.add_event(curr_time, core.id);
        }
        let accepted = core.enqueue_instruction(
            curr_time,
            waddr,
            raddr,
            raddr2,
            ip,
            category,
            isbranch,
            isbranchtaken,
            islock,
            isunlock,
            isbarrier,
            rr,
            rw,
        );
        if !accepted {
            return 0;
        }
        core.free_fetch_slots()
    }

    pub fn set_stack_n_size(&mut self, hthread_id: u32, stack: u64, stacksize: u64) {
        self.o3cores[hthread_id as usize].set_stack_n_size(stack, stacksize);
    }

    pub fn set_active(&mut self, hthread_id: u32, is_active: bool) {
        self.o3cores[hthread_id as usize].set_active(is_active);
    }

    /// Drive the clock until a core requests instructions. Returns
    /// `(hthread id, current time)`; an id equal to `num_hthreads` means
    /// every thread went quiet and the simulation can end.
    pub fn resume_simulation(&mut self, _must_switch: bool) -> (u32, u64) {
        if self.global_q.is_empty() {
            if let Some(core) = self.o3cores.iter().find(|c| c.is_active()) {
                return (core.id.num, self.global_q.curr_time);
            }
        }
        let tid = self.process_events();
        self.maybe_log_progress();
        (tid, self.global_q.curr_time)
    }

    fn process_events(&mut self) -> u32 {
        loop {
            let Some((time, comp)) = self.global_q.pop() else {
                debug!("event queue became empty at cycle {}", self.global_q.curr_time);
                return self.num_hthreads;
            };
            let mut sink = EventSink::new();
            let core_ret = self.dispatch(comp, time, &mut sink);
            self.route(&mut sink);
            if let Some(tid) = core_ret {
                if tid < self.num_hthreads {
                    return tid;
                }
            }
        }
    }

    /// Run until the event queue drains; for self-contained workloads and
    /// tests where no thread waits for more instructions.
    pub fn run_to_idle(&mut self) {
        while let Some((time, comp)) = self.global_q.pop() {
            let mut sink = EventSink::new();
            self.dispatch(comp, time, &mut sink);
            self.route(&mut sink);
        }
    }

    fn dispatch(&mut self, comp: CompId, time: u64, sink: &mut EventSink) -> Option<u32> {
        sink.from = Some(comp);
        let n = comp.num as usize;
        match comp.kind {
            CompKind::O3Core => Some(self.o3cores[n].process_event(time, sink)),
            CompKind::CacheL1D => {
                self.l1ds[n].process_event(time, sink);
                None
            }
            CompKind::CacheL1I => {
                self.l1is[n].process_event(time, sink);
                None
            }
            CompKind::CacheL2 => {
                self.l2s[n].process_event(time, sink);
                None
            }
            CompKind::Directory => {
                self.dirs[n].process_event(time, sink);
                None
            }
            CompKind::MemoryController => {
                self.mcs[n].process_event(time, sink);
                None
            }
            CompKind::Noc => {
                self.noc.process_event(time, sink);
                None
            }
            CompKind::TlbL1D => {
                self.tlbl1ds[n].process_event(time, sink);
                None
            }
            CompKind::TlbL1I => {
                self.tlbl1is[n].process_event(time, sink);
                None
            }
        }
    }

    /// Deliver every pending send; a delivery may itself produce sends
    /// (core nack retries, fixed-latency memory replies), so loop to a
    /// fixed point.
    fn route(&mut self, sink: &mut EventSink) {
        loop {
            for (t, comp) in sink.wakeups.drain(..) {
                self.global_q.add_event(t, comp);
            }
            let Some(send) = sink.sends.pop_front() else {
                break;
            };
            self.deliver(send, sink);
        }
    }

    fn deliver(&mut self, send: Send, sink: &mut EventSink) {
        let Send {
            time,
            dest,
            port,
            msg,
            flits,
            from,
        } = send;
        sink.from = Some(dest);
        let n = dest.num as usize;
        match dest.kind {
            CompKind::Noc => {
                let from = from.expect("NoC deposits need a sender");
                if flits > 1 {
                    // Multi-flit packet: pad with dummies that occupy
                    // departure slots.
                    self.noc.note_data_transfer();
                    for _ in 0..flits - 1 {
                        let mut dummy = msg.clone();
                        dummy.dummy = true;
                        match port {
                            Port::Req => self.noc.add_req_event(time, dummy, from, sink),
                            Port::Crq => self.noc.add_crq_event(time, dummy, from, sink),
                            Port::Rep => self.noc.add_rep_event(time, dummy, from, sink),
                        }
                    }
                }
                match port {
                    Port::Req => self.noc.add_req_event(time, msg, from, sink),
                    Port::Crq => self.noc.add_crq_event(time, msg, from, sink),
                    Port::Rep => self.noc.add_rep_event(time, msg, from, sink),
                }
            }
            CompKind::O3Core => {
                if !matches!(msg.kind, MsgKind::TlbRd | MsgKind::Nack) {
                    self.update_os_page_req_dist(msg.address);
                }
                match port {
                    Port::Req => self.o3cores[n].add_req_event(time, msg, sink),
                    _ => self.o3cores[n].add_rep_event(time, msg, sink),
                }
            }
            CompKind::CacheL1D => match port {
                Port::Req => self.l1ds[n].add_req_event(time, msg, sink),
                _ => self.l1ds[n].add_rep_event(time, msg, sink),
            },
            CompKind::CacheL1I => match port {
                Port::Req => self.l1is[n].add_req_event(time, msg, sink),
                _ => self.l1is[n].add_rep_event(time, msg, sink),
            },
            CompKind::CacheL2 => match port {
                Port::Req => self.l2s[n].add_req_event(time, msg, sink),
                _ => self.l2s[n].add_rep_event(time, msg, sink),
            },
            CompKind::Directory => match port {
                Port::Req => self.dirs[n].add_req_event(time, msg, sink),
                _ => self.dirs[n].add_rep_event(time, msg, sink),
            },
            CompKind::MemoryController => match port {
                Port::Req => self.mcs[n].add_req_event(time, msg, sink),
                _ => self.mcs[n].add_rep_event(time, msg, sink),
            },
            CompKind::TlbL1D => self.tlbl1ds[n].add_req_event(time, msg, sink),
            CompKind::TlbL1I => self.tlbl1is[n].add_req_event(time, msg, sink),
        }
    }

    fn update_os_page_req_dist(&mut self, addr: u64) {
        if self.display_os_page_usage {
            let page_num = self.addr_map.page_num(addr);
            *self.os_page_req_dist.entry(page_num).or_insert(0) += 1;
        }
    }

    /// Every message destroyed, every mailbox drained: holds whenever the
    /// event queue runs dry on a correct protocol.
    pub fn all_mailboxes_empty(&self) -> bool {
        self.l1is.iter().all(CacheL1::mailboxes_empty)
            && self.l1ds.iter().all(CacheL1::mailboxes_empty)
            && self.l2s.iter().all(CacheL2::mailboxes_empty)
            && self.dirs.iter().all(Directory::mailboxes_empty)
            && self.mcs.iter().all(MemoryController::mailboxes_empty)
            && self.tlbl1is.iter().all(TlbL1::mailboxes_empty)
            && self.tlbl1ds.iter().all(TlbL1::mailboxes_empty)
            && self.noc.mailboxes_empty()
    }

    pub fn which_mc(&self, address: u64) -> u32 {
        self.addr_map.which_mc(address)
    }

    fn l1_totals(&self) -> (u64, u64) {
        let mut acc = 0;
        let mut miss = 0;
        for (d, i) in self.l1ds.iter().zip(self.l1is.iter()) {
            acc += d.stats.num_rd_access + d.stats.num_wr_access + i.stats.num_rd_access
                + i.stats.num_wr_access
                - d.stats.num_nack
                - i.stats.num_nack;
            miss += d.stats.num_rd_miss + d.stats.num_wr_miss + i.stats.num_rd_miss
                + i.stats.num_wr_miss
                - d.stats.num_nack
                - i.stats.num_nack;
        }
        (acc, miss)
    }

    fn l2_totals(&self) -> (u64, u64) {
        let mut acc = 0;
        let mut miss = 0;
        for l2 in &self.l2s {
            acc += l2.stats.num_rd_access + l2.stats.num_wr_access - l2.stats.num_nack;
            miss += l2.stats.num_rd_miss + l2.stats.num_wr_miss - l2.stats.num_nack;
        }
        (acc, miss)
    }

    fn maybe_log_progress(&mut self) {
        if self.num_fetched_instrs / self.print_interval == self.num_instrs_printed_last_time {
            return;
        }
        self.num_instrs_printed_last_time = self.num_fetched_instrs / self.print_interval;
        let curr_time = self.global_q.curr_time;

        let ipc1000 = if curr_time > self.curr_time_last {
            1000 * (self.num_fetched_instrs - self.num_fetched_instrs_last)
                * self.lsu_process_interval
                / (curr_time - self.curr_time_last)
        } else {
            0
        };

        let (l1_acc, l1_miss) = self.l1_totals();
        let (l2_acc, l2_miss) = self.l2_totals();
        let num_mem_acc: u64 = self.mcs.iter().map(|m| m.stats.num_reqs).sum();
        let num_curr_pages: usize = self.mcs.iter().map(|m| m.os_page_acc_dist_curr.len()).sum();
        for mc in &mut self.mcs {
            mc.update_acc_dist();
        }
        let num_used_pages: u64 = self.mcs.iter().map(|m| m.os_page_acc_dist.len() as u64).sum();

        info!(
            "[{:12}]: {:10} instrs so far, IPC= {}.{:03}, L1 (acc, miss)=({:7}, {:6}), L2 (acc, miss)=({:6}, {:6}), {:6} mem accs, ({:4}, {:4}) touched pages (this time, 1stly)",
            curr_time,
            self.num_fetched_instrs,
            ipc1000 / 1000,
            ipc1000 % 1000,
            l1_acc - self.num_l1_acc_last,
            l1_miss - self.num_l1_miss_last,
            l2_acc - self.num_l2_acc_last,
            l2_miss - self.num_l2_miss_last,
            num_mem_acc - self.num_mem_acc_last,
            num_curr_pages,
            num_used_pages - self.num_used_pages_last,
        );

        self.num_l1_acc_last = l1_acc;
        self.num_l1_miss_last = l1_miss;
        self.num_l2_acc_last = l2_acc;
        self.num_l2_miss_last = l2_miss;
        self.num_mem_acc_last = num_mem_acc;
        self.num_used_pages_last = num_used_pages;
        self.num_fetched_instrs_last = self.num_fetched_instrs;
        self.curr_time_last = curr_time;
    }

    /// Advisory one-line summaries per component plus the total IPC.
    pub fn print_stats(&mut self) {
        let curr_time = self.global_q.curr_time;
        let ipc1000 = if curr_time == 0 {
            0
        } else {
            1000 * self.num_fetched_instrs * self.lsu_process_interval / curr_time
        };
        println!(
            "  -- total number of fetched instructions : {} (IPC = {:3}.{:03})",
            self.num_fetched_instrs,
            ipc1000 / 1000,
            ipc1000 % 1000
        );
        for core in &self.o3cores {
            core.print_stats();
        }
        for tlb in self.tlbl1is.iter().chain(self.tlbl1ds.iter()) {
            tlb.print_stats();
        }
        for l1 in self.l1is.iter().chain(self.l1ds.iter()) {
            l1.print_stats();
        }
        for l2 in &self.l2s {
            l2.print_stats();
        }
        for dir in &self.dirs {
            dir.print_stats();
        }
        for mc in &mut self.mcs {
            mc.print_stats();
        }
        self.noc.print_stats();
        if self.display_os_page_usage {
            for (&page, &count) in &self.os_page_req_dist {
                println!("  -- page {page:#x} requested {count} times at cores");
            }
        }
    }
}
