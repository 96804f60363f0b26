/*!
Shared test fixtures: parameter presets and machine builders used by the
integration-level suites.
*/

use crate::machine::Machine;
use crate::params::Params;

/// Four cores, two L1s per L2 (two tiles), crossbar, fixed-latency memory.
/// The smallest machine that exercises local and remote coherence.
pub fn two_tile_params() -> Params {
    let mut p = Params::new();
    p.set_u64("pts.num_hthreads", 4);
    p.set_u64("pts.num_l1$_per_l2$", 2);
    p.set_u64("pts.num_mcs", 2);
    p.set_str("pts.noc_type", "xbar");
    p.set_bool("pts.mc.is_fixed_latency", true);
    p
}

pub fn two_tile_machine() -> Machine {
    Machine::new(&two_tile_params()).expect("valid test configuration")
}

/// Inject a load or store straight into a core's reorder buffer and
/// schedule the core; the request then walks the real hierarchy.
pub fn inject_access(machine: &mut Machine, core: u32, addr: u64, isread: bool) {
    let time = machine.current_time();
    machine.o3cores[core as usize].seed_rob_slot(0, addr, isread, false, time);
    machine
        .global_q
        .add_event(time, machine.o3cores[core as usize].id);
}

/// Drive an injected access to completion.
pub fn run_access(machine: &mut Machine, core: u32, addr: u64, isread: bool) {
    inject_access(machine, core, addr, isread);
    machine.run_to_idle();
}
