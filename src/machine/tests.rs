//! End-to-end scenarios on a small two-tile machine: coherence state
//! ladders across cores, remote round-trips, the directory cache, and the
//! L1 prefetcher, each checked down to the final per-component line states.

use crate::machine::Machine;
use crate::message::CohState;
use crate::params::Params;
use crate::test_utils::{run_access, two_tile_machine, two_tile_params};

const LINE: u64 = 0x26C8;

#[test]
fn machine_builds_and_wires_two_tiles() {
    let m = two_tile_machine();
    assert_eq!(m.o3cores.len(), 4);
    assert_eq!(m.l1ds.len(), 4);
    assert_eq!(m.l2s.len(), 2);
    assert_eq!(m.dirs.len(), 2);
    assert_eq!(m.mcs.len(), 2);

    // Cores 0,1 share tile 0; cores 2,3 share tile 1.
    assert_eq!(m.l1ds[0].cachel2, m.l2s[0].id);
    assert_eq!(m.l1ds[1].cachel2, m.l2s[0].id);
    assert_eq!(m.l1ds[2].cachel2, m.l2s[1].id);
    assert_eq!(m.l1ds[3].cachel2, m.l2s[1].id);
    assert_eq!(m.dirs[0].cachel2, m.l2s[0].id);
    assert_eq!(m.l2s[1].directory, m.dirs[1].id);
    assert_eq!(m.mcs[0].directory, m.dirs[0].id);
}

#[test]
fn invalid_topology_is_rejected_at_startup() {
    let mut p = Params::new();
    p.set_u64("pts.num_hthreads", 2);
    p.set_u64("pts.num_l1$_per_l2$", 2);
    p.set_u64("pts.num_mcs", 2); // 2 MCs > 1 L2
    assert!(Machine::new(&p).is_err());
}

/// The I -> E -> S -> M ladder over one line touched by all four cores.
#[test]
fn coherence_ladder_across_four_cores() {
    let mut m = two_tile_machine();
    assert_eq!(m.which_mc(LINE), 0, "the test line homes at tile 0");

    // Step 1: core 0 reads. Everything ends Exclusive.
    run_access(&mut m, 0, LINE, true);
    assert_eq!(m.l1ds[0].line_state(LINE), Some(CohState::Exclusive));
    assert_eq!(
        m.l2s[0].line_states(LINE),
        Some((CohState::Exclusive, CohState::Exclusive))
    );
    assert_eq!(m.dirs[0].line_state(LINE), Some(CohState::Exclusive));
    assert!(m.all_mailboxes_empty());

    // Step 2: core 1 (same tile) reads. The L2's L1-facing state goes
    // Shared while the directory still sees one Exclusive L2.
    run_access(&mut m, 1, LINE, true);
    assert_eq!(m.l1ds[0].line_state(LINE), Some(CohState::Exclusive));
    assert_eq!(m.l1ds[1].line_state(LINE), Some(CohState::Exclusive));
    assert_eq!(
        m.l2s[0].line_states(LINE),
        Some((CohState::Exclusive, CohState::Shared))
    );
    assert_eq!(m.dirs[0].line_state(LINE), Some(CohState::Exclusive));
    assert_eq!(m.l2s[0].sharer_count(LINE), 2);

    // Step 3: core 2 (other tile) reads. Both L2s end Shared at the
    // directory; the data came from tile 0's copy.
    run_access(&mut m, 2, LINE, true);
    assert_eq!(m.l1ds[2].line_state(LINE), Some(CohState::Exclusive));
    assert_eq!(
        m.l2s[0].line_states(LINE),
        Some((CohState::Shared, CohState::Shared))
    );
    assert_eq!(
        m.l2s[1].line_states(LINE),
        Some((CohState::Shared, CohState::Exclusive))
    );
    assert_eq!(m.dirs[0].line_state(LINE), Some(CohState::Shared));
    assert_eq!(m.dirs[0].sharer_count(LINE), 2);

    // Step 4: core 3 writes. Every stale copy is invalidated and tile 1
    // owns the line Modified.
    run_access(&mut m, 3, LINE, false);
    assert_eq!(m.l1ds[0].line_state(LINE), None);
    assert_eq!(m.l1ds[1].line_state(LINE), None);
    assert_eq!(m.l1ds[2].line_state(LINE), None);
    assert_eq!(m.l1ds[3].line_state(LINE), Some(CohState::Modified));
    assert_eq!(m.l2s[0].line_states(LINE), None);
    assert_eq!(
        m.l2s[1].line_states(LINE),
        Some((CohState::Modified, CohState::Modified))
    );
    assert_eq!(m.dirs[0].line_state(LINE), Some(CohState::Modified));
    assert_eq!(m.dirs[0].sharer_count(LINE), 1);
    assert!(m.all_mailboxes_empty(), "no in-flight messages leak");
}

/// A read miss from a remote tile produces exactly one data reply and the
/// line never ends Modified at the directory.
#[test]
fn remote_read_round_trip() {
    let mut m = two_tile_machine();
    let addr = 0x8000u64; // homes at mc 0, requested from tile 1
    assert_eq!(m.which_mc(addr), 0);

    run_access(&mut m, 2, addr, true);

    assert_eq!(m.l1ds[2].line_state(addr), Some(CohState::Exclusive));
    assert_eq!(
        m.l2s[1].line_states(addr),
        Some((CohState::Exclusive, CohState::Exclusive))
    );
    assert_eq!(m.dirs[0].line_state(addr), Some(CohState::Exclusive));
    assert_eq!(m.l1ds[2].stats.num_rd_miss, 1);
    assert_eq!(m.l1ds[2].stats.num_rd_access, 1);
    assert!(m.all_mailboxes_empty());
}

/// Read-then-write from one core: the upgrade travels through write_nd and
/// the line ends Modified everywhere on the owning path.
#[test]
fn write_upgrade_after_read() {
    let mut m = two_tile_machine();
    run_access(&mut m, 0, LINE, true);
    run_access(&mut m, 0, LINE, false);

    assert_eq!(m.l1ds[0].line_state(LINE), Some(CohState::Modified));
    assert_eq!(
        m.l2s[0].line_states(LINE),
        Some((CohState::Modified, CohState::Modified))
    );
    assert_eq!(m.dirs[0].line_state(LINE), Some(CohState::Modified));
    assert_eq!(m.l1ds[0].stats.num_upgrade_req, 1);
    assert!(m.all_mailboxes_empty());
}

/// Directory cache with a single way: an entry pushed out of the cache and
/// touched again induces the synthetic memory round-trip before the
/// protocol resumes.
#[test]
fn directory_cache_eviction_round_trip() {
    let mut p = two_tile_params();
    p.set_bool("pts.dir.has_directory_cache", true);
    p.set_u64("pts.dir.num_ways", 1);
    p.set_u64("pts.dir.num_sets", 16);
    let mut m = Machine::new(&p).expect("valid test configuration");

    let line_a = 0x0u64;
    let line_b = 0x400u64; // same directory-cache set as line_a
    assert_eq!(m.which_mc(line_a), 0);
    assert_eq!(m.which_mc(line_b), 0);

    run_access(&mut m, 0, line_a, true);
    assert_eq!(m.dirs[0].line_state(line_a), Some(CohState::Exclusive));

    // line_b displaces line_a from the one-way directory-cache set.
    run_access(&mut m, 0, line_b, true);
    assert_eq!(m.dirs[0].stats.num_dir_evict, 1);

    // Touching line_a again finds the entry out of the cache: its bits are
    // re-fetched from memory before the E->S transition runs.
    run_access(&mut m, 2, line_a, true);
    assert_eq!(m.dirs[0].line_state(line_a), Some(CohState::Shared));
    assert_eq!(m.dirs[0].sharer_count(line_a), 2);
    assert_eq!(m.dirs[0].stats.num_dir_cache_miss, 3);
    assert!(m.all_mailboxes_empty());
}

/// Next-line prefetching: a strided read pair plants the following line in
/// the L2, and a re-reference scores the prefetch entry.
#[test]
fn next_line_prefetch_fills_l2() {
    let mut p = two_tile_params();
    p.set_bool("pts.l1d$.use_prefetch", true);
    let mut m = Machine::new(&p).expect("valid test configuration");

    let a = 0x2000u64;
    assert_eq!(m.which_mc(a), 0);

    run_access(&mut m, 0, a, true);
    // The predecessor is cached now, so this read prefetches a + 0x80.
    run_access(&mut m, 0, a + 0x40, true);
    // Re-reading marks the outstanding prefetch entry as useful.
    run_access(&mut m, 0, a + 0x40, true);
    assert!(m.l1ds[0].any_prefetch_hit());

    // The prefetched line sits in the L2: the demand read hits there.
    run_access(&mut m, 0, a + 0x80, true);
    let s = &m.l2s[0].stats;
    assert_eq!(
        s.num_rd_access - s.num_rd_miss,
        1,
        "exactly the prefetched line hits in the L2"
    );
    assert!(m.all_mailboxes_empty());
}

/// Competing writes from two tiles serialize through invalidations; the
/// losing tile's retry (nack path) eventually completes and the directory
/// ends with a single Modified owner.
#[test]
fn conflicting_writes_serialize() {
    let mut m = two_tile_machine();

    run_access(&mut m, 0, LINE, false);
    assert_eq!(m.dirs[0].line_state(LINE), Some(CohState::Modified));

    run_access(&mut m, 2, LINE, false);
    assert_eq!(m.dirs[0].line_state(LINE), Some(CohState::Modified));
    assert_eq!(m.dirs[0].sharer_count(LINE), 1);
    assert_eq!(m.l1ds[3].line_state(LINE), None);
    assert_eq!(m.l1ds[2].line_state(LINE), Some(CohState::Modified));
    assert_eq!(m.l2s[0].line_states(LINE), None);
    assert!(m.all_mailboxes_empty());
}

/// The full front-end surface: instructions stream in through
/// `add_instruction`, the driver obeys back-pressure, and the simulation
/// drains cleanly with a plausible instruction count.
#[test]
fn instruction_stream_end_to_end() {
    let mut m = two_tile_machine();
    m.set_active(0, true);
    m.set_stack_n_size(0, 0x7fff_0000, 0x1_0000);

    let mut fed = 0u64;
    let mut time = 0u64;
    while fed < 200 {
        let free = m.add_instruction(
            0,
            time,
            0,                       // no store
            0,
            0x4000 + (fed % 32) * 8, // strided loads
            0,
            8,
            0x1000 + fed * 4, // sequential code
            0,
            false,
            false,
            false,
            false,
            false,
            [1, 0, 0, 0],
            [2, 0, 0, 0],
        );
        fed += 1;
        if free == 0 {
            let (tid, t) = m.resume_simulation(false);
            assert_eq!(tid, 0, "only thread 0 is active");
            time = t;
        }
    }
    m.set_active(0, false);
    m.run_to_idle();

    assert_eq!(m.num_fetched_instrs, 200);
    assert!(m.o3cores[0].stats.num_instrs == 200);
    assert!(m.current_time() > 0);
    assert!(m.all_mailboxes_empty());
}
