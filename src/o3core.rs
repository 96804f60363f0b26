/*!
Out-of-order core model: a circular instruction fetch queue in front of a
reorder buffer with in-order commit.

Pipeline per tick:
1. fetch — at most one I-cache line request covering every queue entry on
   that line (through the I-TLB unless bypassed);
2. dispatch — up to `max_issue_width` ready entries into the ROB, resolving
   register / memory-word / branch dependencies by scanning newest→oldest;
3. execute — issue ready slots under the per-class functional-unit caps;
   memory slots go to the D-TLB / D-cache, the rest complete after their
   class latency (plus the branch-miss bubble when flagged);
4. wake-up — clear dependencies pointing at slots whose completion time is
   now;
5. commit — retire up to `max_commit_width` completed slots from the head.

Nacked accesses retry with a spin-slowdown delay; more than
`consecutive_nack_threshold` nacks in a row indicates a coherence livelock
and aborts the simulation.
*/

use crate::event::EventSink;
use crate::message::{CompId, CompKind, Message, MsgKind};
use crate::params::{ceil_by, Params, Scoped};

/// Instruction categories the core distinguishes. The front-end maps its
/// own decoder's classes onto these.
pub mod category {
    pub const NONE: u32 = 0;
    pub const X87: u32 = 36;
    pub const SSE: u32 = 61;
    pub const CALL: u32 = 5;
}

const WORD_LOG: u32 = 3;

/// Two-bit bimodal predictor XOR-indexed with the shifted global history.
pub struct BranchPredictor {
    num_entries: u32,
    gp_size: u32,
    bimodal_entry: Vec<u32>,
    global_history: u64,
}

impl BranchPredictor {
    pub fn new(num_entries: u32, gp_size: u32) -> Self {
        Self {
            num_entries,
            gp_size,
            // 1 = weakly not taken.
            bimodal_entry: vec![1; num_entries as usize],
            global_history: 0,
        }
    }

    /// Update with the branch outcome; returns whether this was a miss.
    pub fn miss(&mut self, addr: u64, taken: bool) -> bool {
        self.global_history = if self.gp_size == 0 {
            0
        } else {
            (self.global_history << 1) + u64::from(taken)
        };
        let addr = if self.gp_size == 0 {
            addr
        } else {
            addr ^ (self.global_history << (64 - self.gp_size))
        };
        let idx = (addr % self.num_entries as u64) as usize;
        let curr = self.bimodal_entry[idx];
        let miss = (curr > 1 && !taken) || (curr < 2 && taken);
        self.bimodal_entry[idx] = match (curr, taken) {
            (0, false) => 0,
            (3, true) => 3,
            (c, true) => c + 1,
            (c, false) => c - 1,
        };
        miss
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsType {
    NoMem,
    BranchTaken,
    BranchNotTaken,
    Lock,
    Unlock,
    Barrier,
    X87,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueState {
    /// Just arrived.
    NotInQueue,
    /// Contacting the I-cache.
    BeingLoaded,
    /// Returned from the I-cache, waiting to be dispatched.
    Ready,
    Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RobState {
    /// Waiting for its dependencies to execute.
    Issued,
    /// In flight to the data cache.
    Executing,
    /// Done; retires when it reaches the head.
    Completed,
    Invalid,
}

#[derive(Clone, Copy, Debug)]
struct O3Queue {
    state: QueueState,
    ready_time: u64,
    waddr: u64,
    raddr: u64,
    raddr2: u64,
    ip: u64,
    ins_type: InsType,
    rr: [u32; 4],
    rw: [u32; 4],
}

impl O3Queue {
    fn empty() -> Self {
        Self {
            state: QueueState::Invalid,
            ready_time: 0,
            waddr: 0,
            raddr: 0,
            raddr2: 0,
            ip: 0,
            ins_type: InsType::NoMem,
            rr: [0; 4],
            rw: [0; 4],
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct O3Rob {
    state: RobState,
    ready_time: u64,
    ip: u64,
    /// 0 means no memory access.
    memaddr: u64,
    isread: bool,
    branch_miss: bool,
    mem_dep: i32,
    instr_dep: i32,
    branch_dep: i32,
    ins_type: InsType,
    rr: [i32; 4],
    rw: [u32; 4],
}

impl O3Rob {
    fn empty() -> Self {
        Self {
            state: RobState::Invalid,
            ready_time: 0,
            ip: 0,
            memaddr: 0,
            isread: false,
            branch_miss: false,
            mem_dep: -1,
            instr_dep: -1,
            branch_dep: -1,
            ins_type: InsType::NoMem,
            rr: [-1; 4],
            rw: [0; 4],
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CoreStats {
    pub num_instrs: u64,
    pub num_branch: u64,
    pub num_branch_miss: u64,
    pub num_nacks: u64,
    pub num_x87_ops: u64,
    pub num_call_ops: u64,
    pub total_mem_wr_time: u64,
    pub total_mem_rd_time: u64,
    pub total_dependency_distance: u64,
}

pub struct O3Core {
    pub id: CompId,
    pub process_interval: u64,
    num_hthreads: u32,

    lsu_to_l1i_t: u64,
    lsu_to_l1d_t: u64,
    branch_miss_penalty: u64,
    spinning_slowdown: u64,
    lock_t: u64,
    unlock_t: u64,
    barrier_t: u64,
    sse_t: u64,
    consecutive_nack_threshold: u64,
    bypass_tlb: bool,
    mimick_inorder: bool,
    /// I-cache line granularity used to group fetches.
    l1i_set_lsb: u32,

    o3queue_max_size: usize,
    o3rob_max_size: usize,
    max_issue_width: usize,
    max_commit_width: usize,
    max_alu: i32,
    max_ldst: i32,
    max_ld: i32,
    max_st: i32,
    max_sse: i32,

    pub cachel1i: CompId,
    pub cachel1d: CompId,
    pub tlbl1i: CompId,
    pub tlbl1d: CompId,
    bp: BranchPredictor,

    pub(crate) active: bool,
    pub(crate) resume_time: u64,
    pub(crate) stack: u64,
    pub(crate) stacksize: u64,

    o3queue: Vec<O3Queue>,
    o3queue_head: usize,
    pub(crate) o3queue_size: usize,
    o3rob: Vec<O3Rob>,
    o3rob_head: usize,
    o3rob_size: usize,

    latest_ip: u64,
    num_consecutive_nacks: u64,
    pub stats: CoreStats,
}

impl O3Core {
    pub fn new(num: u32, params: &Params) -> Self {
        let p = Scoped::new(params, CompKind::O3Core.prefix());
        let process_interval = p.u64("process_interval", 80);
        let round = |v: u64| ceil_by(v, process_interval);
        let o3rob_max_size = p.u64("o3rob_max_size", 16) as usize;
        assert!(o3rob_max_size > 4, "the reorder buffer needs more than 4 slots");
        let o3queue_max_size = p.u64("o3queue_max_size", 64) as usize + 4;
        let max_commit_width = p.u64("max_commit_width", 4) as i64;
        Self {
            id: CompId::new(CompKind::O3Core, num),
            process_interval,
            num_hthreads: params.get_u64("pts.num_hthreads", 1024) as u32,
            lsu_to_l1i_t: p.u64("to_l1i_t", 10),
            lsu_to_l1d_t: p.u64("to_l1d_t", 10),
            branch_miss_penalty: round(p.u64("branch_miss_penalty", 100)),
            spinning_slowdown: p.u64("spinning_slowdown", 10),
            lock_t: round(p.u64("lock_t", 100)),
            unlock_t: round(p.u64("unlock_t", 100)),
            barrier_t: round(p.u64("barrier_t", 100)),
            sse_t: p.u64("sse_t", 40),
            consecutive_nack_threshold: p.u64("consecutive_nack_threshold", 1000),
            bypass_tlb: p.bool("bypass_tlb", false),
            mimick_inorder: p.bool("mimick_inorder", false),
            l1i_set_lsb: params.get_u64("pts.l1i$.set_lsb", 6) as u32,
            o3queue_max_size,
            o3rob_max_size,
            max_issue_width: p.u64("max_issue_width", 4) as usize,
            max_commit_width: max_commit_width as usize,
            max_alu: p.u64("max_alu", max_commit_width as u64) as i32,
            max_ldst: p.u64("max_ldst", max_commit_width as u64) as i32,
            max_ld: p.u64("max_ld", max_commit_width as u64) as i32,
            max_st: p.u64("max_st", max_commit_width as u64) as i32,
            max_sse: p.u64("max_sse", max_commit_width as u64) as i32,
            cachel1i: CompId::new(CompKind::CacheL1I, num),
            cachel1d: CompId::new(CompKind::CacheL1D, num),
            tlbl1i: CompId::new(CompKind::TlbL1I, num),
            tlbl1d: CompId::new(CompKind::TlbL1D, num),
            bp: BranchPredictor::new(
                p.u64("num_bp_entries", 256) as u32,
                p.u64("gp_size", 0) as u32,
            ),
            active: false,
            resume_time: 0,
            stack: 0,
            stacksize: 0,
            o3queue: vec![O3Queue::empty(); o3queue_max_size],
            o3queue_head: 0,
            o3queue_size: 0,
            o3rob: vec![O3Rob::empty(); o3rob_max_size],
            o3rob_head: 0,
            o3rob_size: 0,
            latest_ip: 0,
            num_consecutive_nacks: 0,
            stats: CoreStats::default(),
        }
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_stack_n_size(&mut self, stack: u64, stacksize: u64) {
        self.stack = stack;
        self.stacksize = stacksize;
    }

    /// Memory in the thread's own stack is considered private.
    pub fn is_private(&self, addr: u64) -> bool {
        addr >= self.stack && addr < self.stack + self.stacksize
    }

    /// Free fetch-queue slots after this insertion (0 = back-pressure).
    pub fn free_fetch_slots(&self) -> u32 {
        if self.o3queue_size + 4 > self.o3queue_max_size {
            0
        } else {
            (self.o3queue_max_size - (self.o3queue_size + 4)) as u32
        }
    }

    /// Deposit one retired instruction from the front-end. Returns false if
    /// the queue is full and the instruction was dropped.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn enqueue_instruction(
        &mut self,
        curr_time: u64,
        waddr: u64,
        raddr: u64,
        raddr2: u64,
        ip: u64,
        category: u32,
        isbranch: bool,
        isbranchtaken: bool,
        islock: bool,
        isunlock: bool,
        isbarrier: bool,
        rr: [u32; 4],
        rw: [u32; 4],
    ) -> bool {
        self.stats.num_instrs += 1;
        if category == category::CALL {
            self.stats.num_call_ops += 1;
        }
        if category == category::X87 || category == category::SSE {
            self.stats.num_x87_ops += 1;
        }
        if self.o3queue_size >= self.o3queue_max_size {
            return false;
        }
        let ins_type = if isbranch && isbranchtaken {
            InsType::BranchTaken
        } else if isbranch {
            InsType::BranchNotTaken
        } else if category == category::X87 || category == category::SSE {
            // SSE ops share the x87 latency class.
            InsType::X87
        } else if islock {
            InsType::Lock
        } else if isunlock {
            InsType::Unlock
        } else if isbarrier {
            InsType::Barrier
        } else {
            InsType::NoMem
        };
        let idx = (self.o3queue_head + self.o3queue_size) % self.o3queue_max_size;
        self.o3queue[idx] = O3Queue {
            state: QueueState::NotInQueue,
            ready_time: curr_time,
            waddr,
            raddr,
            raddr2,
            ip,
            ins_type,
            rr,
            rw,
        };
        self.o3queue_size += 1;
        true
    }

    pub fn process_event(&mut self, curr_time: u64, sink: &mut EventSink) -> u32 {
        // Ask the driver for more work once the queue is half empty.
        if self.o3queue_size <= (self.o3queue_max_size >> 1) && self.active {
            sink.wake(curr_time, self.id);
            return self.id.num;
        }

        self.fetch(curr_time, sink);
        self.dispatch(curr_time, sink);
        self.execute(curr_time, sink);
        self.wakeup(curr_time, sink);
        self.commit(curr_time, sink);

        self.num_hthreads
    }

    /// Send one I-cache line request covering every waiting queue entry on
    /// that line.
    fn fetch(&mut self, curr_time: u64, sink: &mut EventSink) {
        let set_lsb = self.l1i_set_lsb;
        let mut addr_to_read = 0u64;
        for i in 0..self.o3queue_size {
            let idx = (i + self.o3queue_head) % self.o3queue_max_size;
            if self.o3queue[idx].state != QueueState::NotInQueue {
                continue;
            }
            let line = (self.o3queue[idx].ip >> set_lsb) << set_lsb;
            if addr_to_read == 0 {
                addr_to_read = line;
                self.o3queue[idx].state = QueueState::BeingLoaded;
                let mut lqe = Message::bare(MsgKind::Read, line, self.id.num);
                lqe.push(self.id);
                if self.bypass_tlb {
                    sink.req(curr_time + self.lsu_to_l1i_t, self.cachel1i, lqe);
                } else {
                    lqe.kind = MsgKind::TlbRd;
                    sink.req(curr_time + self.lsu_to_l1i_t, self.tlbl1i, lqe);
                }
            } else if addr_to_read == line {
                self.o3queue[idx].state = QueueState::BeingLoaded;
            }
        }
    }

    /// Move ready queue entries into the ROB, resolving dependencies.
    fn dispatch(&mut self, curr_time: u64, sink: &mut EventSink) {
        for _ in 0..self.max_issue_width {
            if self.o3queue_size == 0 || self.o3rob_size >= self.o3rob_max_size - 3 {
                break;
            }
            let entry = self.o3queue[self.o3queue_head];
            if entry.state != QueueState::Ready || entry.ready_time > curr_time {
                break;
            }

            let mut dependency_distance = self.o3rob_size as u64;
            let mut branch_miss = false;
            if matches!(entry.ins_type, InsType::BranchTaken | InsType::BranchNotTaken) {
                self.stats.num_branch += 1;
                if self
                    .bp
                    .miss(entry.ip, entry.ins_type == InsType::BranchTaken)
                {
                    self.stats.num_branch_miss += 1;
                    branch_miss = true;
                }
            }

            // Youngest unresolved mispredicted branch gates this entry.
            let mut branch_dep = -1i32;
            for j in 0..self.o3rob_size {
                let rob_idx = (self.o3rob_head + self.o3rob_size - 1 - j) % self.o3rob_max_size;
                let slot = &self.o3rob[rob_idx];
                if slot.state == RobState::Completed && slot.ready_time <= curr_time {
                    continue;
                }
                if slot.branch_miss {
                    branch_dep = rob_idx as i32;
                    dependency_distance = dependency_distance.min(j as u64 + 1);
                    break;
                }
            }

            // Register dependencies; false dependencies are assumed renamed
            // away.
            let mut rr = [-1i32; 4];
            for j in 0..self.o3rob_size {
                let rob_idx = (self.o3rob_head + self.o3rob_size - 1 - j) % self.o3rob_max_size;
                let slot = &self.o3rob[rob_idx];
                if slot.state == RobState::Completed && slot.ready_time <= curr_time {
                    continue;
                }
                for (r, dep) in entry.rr.iter().zip(rr.iter_mut()) {
                    if *r != 0 && *dep == -1 && slot.rw.contains(r) {
                        *dep = rob_idx as i32;
                        dependency_distance = dependency_distance.min(j as u64 + 1);
                    }
                }
            }

            sink.wake(curr_time + self.process_interval, self.id);

            let mut instr_dep = -1i32;
            let mut pushed = false;
            for (addr, isread) in [
                (entry.raddr, true),
                (entry.raddr2, true),
                (entry.waddr, false),
            ] {
                if addr == 0 {
                    continue;
                }
                let mem_dep = self.find_mem_dep(curr_time, addr, &mut dependency_distance);
                let rob_idx = (self.o3rob_head + self.o3rob_size) % self.o3rob_max_size;
                self.o3rob[rob_idx] = O3Rob {
                    state: RobState::Issued,
                    ready_time: curr_time + self.process_interval,
                    ip: entry.ip,
                    memaddr: addr,
                    isread,
                    branch_miss,
                    mem_dep,
                    instr_dep,
                    branch_dep,
                    ins_type: entry.ins_type,
                    rr,
                    rw: entry.rw,
                };
                instr_dep = rob_idx as i32;
                self.o3rob_size += 1;
                pushed = true;
            }
            if !pushed {
                let rob_idx = (self.o3rob_head + self.o3rob_size) % self.o3rob_max_size;
                self.o3rob[rob_idx] = O3Rob {
                    state: RobState::Issued,
                    ready_time: curr_time + self.process_interval,
                    ip: entry.ip,
                    memaddr: 0,
                    isread: false,
                    branch_miss,
                    mem_dep: -1,
                    instr_dep,
                    branch_dep,
                    ins_type: entry.ins_type,
                    rr,
                    rw: entry.rw,
                };
                self.o3rob_size += 1;
            }

            self.o3queue[self.o3queue_head].state = QueueState::Invalid;
            self.o3queue_size -= 1;
            self.o3queue_head = (self.o3queue_head + 1) % self.o3queue_max_size;
            self.stats.total_dependency_distance += dependency_distance;
        }
    }

    /// Youngest older slot touching the same memory word.
    fn find_mem_dep(&self, curr_time: u64, addr: u64, dependency_distance: &mut u64) -> i32 {
        for j in 0..self.o3rob_size {
            let rob_idx = (self.o3rob_head + self.o3rob_size - 1 - j) % self.o3rob_max_size;
            let slot = &self.o3rob[rob_idx];
            if (slot.state != RobState::Completed || slot.ready_time > curr_time)
                && (slot.memaddr >> WORD_LOG) == (addr >> WORD_LOG)
            {
                *dependency_distance = (*dependency_distance).min(j as u64 + 1);
                return rob_idx as i32;
            }
        }
        -1
    }

    fn execute(&mut self, curr_time: u64, sink: &mut EventSink) {
        let mut num_alu = 0i32;
        let mut num_ldst = 0i32;
        let mut num_ld = 0i32;
        let mut num_st = 0i32;
        let mut num_sse = 0i32;

        for i in 0..self.o3rob_size {
            let rob_idx = (self.o3rob_head + i) % self.o3rob_max_size;
            let slot = self.o3rob[rob_idx];

            if slot.state != RobState::Issued || slot.ready_time > curr_time {
                if self.mimick_inorder {
                    sink.wake(curr_time + self.process_interval, self.id);
                    break;
                }
                continue;
            }
            let no_deps = slot.mem_dep == -1
                && slot.instr_dep == -1
                && slot.branch_dep == -1
                && slot.rr.iter().all(|&r| r == -1);
            if !no_deps {
                if self.mimick_inorder {
                    sink.wake(curr_time + self.process_interval, self.id);
                    break;
                }
                continue;
            }

            if slot.memaddr == 0 {
                if num_alu < self.max_alu && (slot.ins_type != InsType::X87 || num_sse < self.max_sse)
                {
                    let latency = match slot.ins_type {
                        InsType::Lock => self.lock_t,
                        InsType::Unlock => self.unlock_t,
                        InsType::Barrier => self.barrier_t,
                        InsType::X87 => self.sse_t,
                        _ if slot.branch_miss => {
                            self.branch_miss_penalty + self.process_interval
                        }
                        _ => self.process_interval,
                    };
                    self.o3rob[rob_idx].state = RobState::Completed;
                    self.o3rob[rob_idx].ready_time = curr_time + latency;
                    sink.wake(self.o3rob[rob_idx].ready_time, self.id);
                    num_alu += 1;
                    if slot.ins_type == InsType::X87 {
                        num_sse += 1;
                    }
                }
            } else if num_ldst < self.max_ldst
                && ((slot.isread && num_ld < self.max_ld)
                    || (!slot.isread && num_st < self.max_st))
            {
                self.o3rob[rob_idx].state = RobState::Executing;
                let mut lqe = Message::bare(
                    if slot.isread {
                        MsgKind::Read
                    } else {
                        MsgKind::Write
                    },
                    slot.memaddr,
                    self.id.num,
                );
                lqe.push(self.id);
                lqe.rob_entry = Some(rob_idx);
                if self.bypass_tlb {
                    sink.req(curr_time + self.lsu_to_l1d_t, self.cachel1d, lqe);
                } else {
                    lqe.kind = MsgKind::TlbRd;
                    sink.req(curr_time + self.lsu_to_l1d_t, self.tlbl1d, lqe);
                }
                num_ldst += 1;
                if slot.isread {
                    num_ld += 1;
                } else {
                    num_st += 1;
                }
            }
        }
    }

    /// Clear dependencies pointing at slots that completed this tick.
    fn wakeup(&mut self, curr_time: u64, sink: &mut EventSink) {
        let mut scheduled = false;
        for i in 0..self.o3rob_size {
            let rob_idx = (self.o3rob_head + i) % self.o3rob_max_size;
            if self.o3rob[rob_idx].state != RobState::Completed
                || self.o3rob[rob_idx].ready_time != curr_time
            {
                continue;
            }
            if !scheduled {
                scheduled = true;
                sink.wake(curr_time + self.process_interval, self.id);
            }
            for j in (i + 1)..self.o3rob_size {
                let next_idx = (self.o3rob_head + j) % self.o3rob_max_size;
                let next = &mut self.o3rob[next_idx];
                if next.state != RobState::Issued {
                    continue;
                }
                let dep = rob_idx as i32;
                if next.mem_dep == dep {
                    next.mem_dep = -1;
                }
                if next.instr_dep == dep {
                    next.instr_dep = -1;
                }
                if next.branch_dep == dep {
                    next.branch_dep = -1;
                }
                for r in next.rr.iter_mut() {
                    if *r == dep {
                        *r = -1;
                    }
                }
            }
        }
    }

    fn commit(&mut self, curr_time: u64, sink: &mut EventSink) {
        for _ in 0..self.max_commit_width {
            if self.o3rob_size == 0 {
                break;
            }
            let head = &self.o3rob[self.o3rob_head];
            if head.state != RobState::Completed || head.ready_time > curr_time {
                break;
            }
            self.o3rob[self.o3rob_head].state = RobState::Invalid;
            self.o3rob_size -= 1;
            self.o3rob_head = (self.o3rob_head + 1) % self.o3rob_max_size;
        }
        if self.o3rob_size > 0
            && self.o3rob[self.o3rob_head].state == RobState::Completed
            && self.o3rob[self.o3rob_head].ready_time <= curr_time
        {
            sink.wake(curr_time + self.process_interval, self.id);
        }
    }

    /// I-side arrivals (the L1I and I-TLB answer on the request port).
    pub fn add_req_event(&mut self, event_time: u64, mut msg: Message, sink: &mut EventSink) {
        match msg.kind {
            MsgKind::TlbRd => {
                self.resume_time = event_time;
                msg.from.clear();
                msg.push(self.id);
                self.latest_ip = msg.address;
                msg.kind = MsgKind::Read;
                sink.req(event_time + self.lsu_to_l1i_t, self.cachel1i, msg);
            }
            MsgKind::Nack => {
                self.note_nack(event_time, &msg);
                msg.from.clear();
                msg.push(self.id);
                msg.kind = MsgKind::Read;
                sink.req(
                    event_time + self.lsu_to_l1i_t + self.spinning_slowdown * self.process_interval,
                    self.cachel1i,
                    msg,
                );
            }
            _ => {
                let aligned = ceil_by(event_time, self.process_interval);
                sink.wake(aligned, self.id);
                self.num_consecutive_nacks = 0;
                // Every queue entry on the fetched line becomes ready.
                for i in 0..self.o3queue_size {
                    let idx = (i + self.o3queue_head) % self.o3queue_max_size;
                    let line =
                        (self.o3queue[idx].ip >> self.l1i_set_lsb) << self.l1i_set_lsb;
                    if self.o3queue[idx].state == QueueState::BeingLoaded && msg.address == line {
                        self.o3queue[idx].state = QueueState::Ready;
                        self.o3queue[idx].ready_time = aligned;
                    }
                }
            }
        }
    }

    /// D-side arrivals (the L1D and D-TLB answer on the reply port).
    pub fn add_rep_event(&mut self, event_time: u64, mut msg: Message, sink: &mut EventSink) {
        match msg.kind {
            MsgKind::TlbRd => {
                self.resume_time = event_time;
                let rob_entry = msg.rob_entry.expect("data access without a ROB slot");
                msg.from.clear();
                msg.push(self.id);
                msg.kind = if self.o3rob[rob_entry].isread {
                    MsgKind::Read
                } else {
                    MsgKind::Write
                };
                sink.req(event_time + self.lsu_to_l1d_t, self.cachel1d, msg);
            }
            MsgKind::Nack => {
                self.note_nack(event_time, &msg);
                let rob_entry = msg.rob_entry.expect("data access without a ROB slot");
                msg.from.clear();
                msg.push(self.id);
                msg.kind = if self.o3rob[rob_entry].isread {
                    MsgKind::Read
                } else {
                    MsgKind::Write
                };
                sink.req(
                    event_time + self.lsu_to_l1d_t + self.spinning_slowdown * self.process_interval,
                    self.cachel1d,
                    msg,
                );
            }
            _ => {
                let aligned = ceil_by(event_time, self.process_interval);
                sink.wake(aligned, self.id);
                self.num_consecutive_nacks = 0;
                let rob_entry = msg.rob_entry.expect("data reply without a ROB slot");
                let slot = &mut self.o3rob[rob_entry];
                if slot.isread {
                    self.stats.total_mem_rd_time += aligned - slot.ready_time;
                } else {
                    self.stats.total_mem_wr_time += aligned - slot.ready_time;
                }
                slot.state = RobState::Completed;
                slot.ready_time = aligned
                    + if slot.branch_miss {
                        self.branch_miss_penalty
                    } else {
                        0
                    };
                sink.wake(slot.ready_time, self.id);
            }
        }
    }

    fn note_nack(&mut self, event_time: u64, msg: &Message) {
        self.stats.num_nacks += 1;
        self.num_consecutive_nacks += 1;
        self.resume_time = event_time;
        if self.num_consecutive_nacks > self.consecutive_nack_threshold {
            panic!(
                "{}: more than {} consecutive nacks (latest_ip = {:#x}, {})",
                self.id, self.consecutive_nack_threshold, self.latest_ip, msg
            );
        }
    }

    pub fn rob_occupancy(&self) -> usize {
        self.o3rob_size
    }

    pub fn print_stats(&self) {
        let s = &self.stats;
        if s.num_instrs == 0 {
            return;
        }
        let miss_pct = if s.num_branch > 0 {
            100.0 * s.num_branch_miss as f64 / s.num_branch as f64
        } else {
            0.0
        };
        println!(
            "  -- OOO [{:3}] : fetched {:10} instrs, branch (miss, access)=({:8}, {:10})= {:6.2}%, nacks= {}, x87_ops= {}, call_ops= {}, latest_ip= {:#x}, tot_mem_wr_time= {}, tot_mem_rd_time= {}, tot_dep_dist= {}",
            self.id.num,
            s.num_instrs,
            s.num_branch_miss,
            s.num_branch,
            miss_pct,
            s.num_nacks,
            s.num_x87_ops,
            s.num_call_ops,
            self.latest_ip,
            s.total_mem_wr_time,
            s.total_mem_rd_time,
            s.total_dependency_distance
        );
    }
}

#[cfg(test)]
impl O3Core {
    /// Place a completed/issued slot directly into the ROB (tests drive the
    /// ROB without the fetch front-end).
    pub(crate) fn seed_rob_slot(
        &mut self,
        pos: usize,
        memaddr: u64,
        isread: bool,
        state_completed: bool,
        ready_time: u64,
    ) {
        let mut slot = O3Rob::empty();
        slot.memaddr = memaddr;
        slot.isread = isread;
        slot.state = if state_completed {
            RobState::Completed
        } else {
            RobState::Issued
        };
        slot.ready_time = ready_time;
        self.o3rob[pos] = slot;
        self.o3rob_head = 0;
        self.o3rob_size = self.o3rob_size.max(pos + 1);
    }

    /// Mark a seeded slot as still executing (no completion time yet).
    pub(crate) fn seed_rob_executing(&mut self, pos: usize, memaddr: u64) {
        let mut slot = O3Rob::empty();
        slot.memaddr = memaddr;
        slot.state = RobState::Executing;
        self.o3rob[pos] = slot;
        self.o3rob_head = 0;
        self.o3rob_size = self.o3rob_size.max(pos + 1);
    }

    pub(crate) fn rob_slot_completed(&mut self, pos: usize, ready_time: u64) {
        self.o3rob[pos].state = RobState::Completed;
        self.o3rob[pos].ready_time = ready_time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predictor_learns_taken_biased_stream() {
        let mut bp = BranchPredictor::new(256, 0);
        let mut misses = 0;
        for _ in 0..1000 {
            if bp.miss(0x400_000, true) {
                misses += 1;
            }
        }
        // Only the warm-up predictions miss.
        assert!(misses <= 2, "got {misses} misses on a taken-biased stream");
    }

    #[test]
    fn predictor_counters_saturate() {
        let mut bp = BranchPredictor::new(16, 0);
        for _ in 0..10 {
            bp.miss(0x10, true);
        }
        // One not-taken outcome flips the prediction off the saturated
        // counter but not the next one.
        assert!(bp.miss(0x10, false));
        assert!(bp.miss(0x10, false));
        assert!(!bp.miss(0x10, false));
    }

    #[test]
    fn rob_commits_in_order() {
        let params = Params::new();
        let mut core = O3Core::new(0, &params);
        let mut sink = EventSink::new();

        // Scenario: slots 0,1 completed; 2 executing; 3..=6 completed.
        core.seed_rob_slot(0, 0, false, true, 0);
        core.seed_rob_slot(1, 0, false, true, 0);
        core.seed_rob_executing(2, 0x1000);
        for pos in 3..7 {
            core.seed_rob_slot(pos, 0, false, true, 0);
        }

        core.process_event(0, &mut sink);
        // Only the first two retire; slot 2 blocks the rest.
        assert_eq!(core.rob_occupancy(), 5);

        core.rob_slot_completed(2, 80);
        core.process_event(80, &mut sink);
        // Up to max_commit_width (4) retire now.
        assert_eq!(core.rob_occupancy(), 1);
        core.process_event(160, &mut sink);
        assert_eq!(core.rob_occupancy(), 0);
    }

    #[test]
    fn memory_slot_issues_dcache_access_with_rob_tag() {
        let mut params = Params::new();
        params.set_bool("pts.o3core.bypass_tlb", true);
        let mut core = O3Core::new(0, &params);
        let mut sink = EventSink::new();

        core.seed_rob_slot(0, 0x2000, true, false, 0);
        core.process_event(0, &mut sink);

        let send = sink
            .sends
            .iter()
            .find(|s| s.dest == core.cachel1d)
            .expect("memory slot reaches the D-cache");
        assert_eq!(send.msg.kind, MsgKind::Read);
        assert_eq!(send.msg.rob_entry, Some(0));
    }

    #[test]
    fn dcache_reply_completes_the_slot() {
        let mut params = Params::new();
        params.set_bool("pts.o3core.bypass_tlb", true);
        let mut core = O3Core::new(0, &params);
        let mut sink = EventSink::new();

        core.seed_rob_slot(0, 0x2000, true, false, 0);
        core.process_event(0, &mut sink);

        let mut reply = Message::bare(MsgKind::Read, 0x2000, 0);
        reply.push(core.id);
        reply.rob_entry = Some(0);
        core.add_rep_event(400, reply, &mut sink);

        core.process_event(400, &mut sink);
        assert_eq!(core.rob_occupancy(), 0, "completed slot retires");
    }

    #[test]
    fn nacked_access_retries_with_spin_slowdown() {
        let mut params = Params::new();
        params.set_bool("pts.o3core.bypass_tlb", true);
        let mut core = O3Core::new(0, &params);
        let mut sink = EventSink::new();

        core.seed_rob_slot(0, 0x2000, true, false, 0);
        let mut nack = Message::bare(MsgKind::Nack, 0x2000, 0);
        nack.push(core.id);
        nack.rob_entry = Some(0);
        core.add_rep_event(100, nack, &mut sink);

        let retry = sink.sends.pop_back().expect("retry goes out");
        assert_eq!(retry.dest, core.cachel1d);
        assert_eq!(retry.msg.kind, MsgKind::Read);
        assert!(retry.time > 100, "spin slowdown delays the retry");
        assert_eq!(core.stats.num_nacks, 1);
    }
}
