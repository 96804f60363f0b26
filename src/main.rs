/*!
Demo driver: feeds a synthetic instruction stream into the simulator and
prints the per-component statistics at the end.

This stands in for the real front-end (a binary-instrumentation tool or a
trace reader) behind the same `add_instruction` / `resume_simulation`
surface: feed a thread until it reports zero free fetch-queue slots, let
the engine run, and continue with whichever thread it asks for next.
*/

use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cmpsim::{Machine, Params};

#[derive(Parser)]
#[command(name = "cmpsim", about = "Cycle-level CMP memory-hierarchy timing simulator")]
struct Args {
    /// TOML parameter file; built-in defaults are used when omitted.
    #[arg(short, long)]
    mdfile: Option<String>,

    /// Number of instructions to run per hardware thread.
    #[arg(short = 'n', long, default_value_t = 100_000)]
    instrs: u64,

    /// Fraction of instructions that access memory, in percent.
    #[arg(long, default_value_t = 40)]
    mem_ratio: u32,

    /// Fraction of memory accesses that are stores, in percent.
    #[arg(long, default_value_t = 30)]
    store_ratio: u32,

    /// Size of the per-thread data region in bytes.
    #[arg(long, default_value_t = 1 << 20)]
    working_set: u64,

    /// RNG seed, for reproducible runs.
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

/// Per-thread synthetic stream state: a strided/random mix over a private
/// working set, with occasional branches.
struct StreamGen {
    rng: StdRng,
    base: u64,
    working_set: u64,
    ip: u64,
    next_stride: u64,
    mem_ratio: u32,
    store_ratio: u32,
}

impl StreamGen {
    fn new(thread: u32, args: &Args) -> Self {
        Self {
            rng: StdRng::seed_from_u64(args.seed ^ (thread as u64) << 32),
            base: 0x1000_0000 + (thread as u64) * args.working_set,
            working_set: args.working_set,
            ip: 0x40_0000 + (thread as u64) * 0x10_0000,
            next_stride: 0,
            mem_ratio: args.mem_ratio,
            store_ratio: args.store_ratio,
        }
    }

    /// One retired instruction: (waddr, raddr, ip, isbranch, taken).
    fn next(&mut self) -> (u64, u64, u64, bool, bool) {
        self.ip += 4;
        let isbranch = self.rng.gen_ratio(1, 8);
        if isbranch {
            // Taken-biased, like the backward branches of a hot loop.
            let taken = self.rng.gen_ratio(7, 8);
            if taken {
                self.ip -= 64;
            }
            return (0, 0, self.ip, true, taken);
        }
        if !self.rng.gen_ratio(self.mem_ratio, 100) {
            return (0, 0, self.ip, false, false);
        }
        // Mostly sequential walk with occasional random jumps, so both the
        // prefetcher and the DRAM row buffers see realistic locality.
        let addr = if self.rng.gen_ratio(1, 16) {
            self.base + self.rng.gen_range(0..self.working_set / 8) * 8
        } else {
            self.next_stride = (self.next_stride + 8) % self.working_set;
            self.base + self.next_stride
        };
        if self.rng.gen_ratio(self.store_ratio, 100) {
            (addr, 0, self.ip, false, false)
        } else {
            (0, addr, self.ip, false, false)
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let params = match &args.mdfile {
        Some(path) => match Params::from_toml_file(path) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("cannot load {path}: {e}");
                std::process::exit(1);
            }
        },
        None => {
            let mut p = Params::new();
            p.set_u64("pts.num_hthreads", 4);
            p.set_u64("pts.num_l1$_per_l2$", 2);
            p.set_u64("pts.num_mcs", 2);
            p.set_str("pts.noc_type", "xbar");
            p.set_str("pts.mc.scheduling_policy", "open");
            p
        }
    };

    let mut machine = match Machine::new(&params) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let num_threads = machine.num_hthreads();
    let mut gens: Vec<StreamGen> = (0..num_threads)
        .map(|t| StreamGen::new(t, &args))
        .collect();
    let mut remaining: Vec<u64> = vec![args.instrs; num_threads as usize];
    for t in 0..num_threads {
        machine.set_active(t, true);
        machine.set_stack_n_size(t, 0x7fff_0000_0000 + ((t as u64) << 24), 1 << 24);
    }
    info!("running {} instrs on {} threads", args.instrs, num_threads);

    // Round-robin over the threads; whenever one reports zero free fetch
    // slots, hand control back to the engine until it asks for more.
    let mut time = 0u64;
    'feed: loop {
        let mut progressed = false;
        for tid in 0..num_threads {
            if remaining[tid as usize] == 0 {
                continue;
            }
            progressed = true;
            let (waddr, raddr, ip, isbranch, taken) = gens[tid as usize].next();
            let free = machine.add_instruction(
                tid,
                time,
                waddr,
                if waddr != 0 { 8 } else { 0 },
                raddr,
                0,
                if raddr != 0 { 8 } else { 0 },
                ip,
                0,
                isbranch,
                taken,
                false,
                false,
                false,
                [1, 2, 0, 0],
                [3, 0, 0, 0],
            );
            remaining[tid as usize] -= 1;
            if remaining[tid as usize] == 0 {
                machine.set_active(tid, false);
            }

            if free == 0 {
                let (next, t) = machine.resume_simulation(false);
                time = t;
                if next >= num_threads {
                    break 'feed;
                }
            }
        }
        if !progressed {
            break;
        }
    }

    // Drain whatever is still in flight.
    for t in 0..num_threads {
        machine.set_active(t, false);
    }
    machine.run_to_idle();

    machine.print_stats();
}
