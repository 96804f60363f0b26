#![doc = r#"
cmpsim library crate.

A cycle-level, discrete-event timing simulator of a cache-coherent
chip-multiprocessor memory hierarchy. An external front-end feeds retired
instructions through `Machine::add_instruction`; the engine advances a
global clock and models the full path of every memory access: out-of-order
core, private L1s and TLBs, shared L2s, MESI directories, the on-chip
interconnect, and DRAM memory controllers.

Modules:
- params: flat typed parameter store (TOML table-of-keys loading)
- message: message alphabet, coherence states, component ids
- event: global event queue, mailboxes, outgoing-send sink
- cache: L1 and L2 caches
- directory: per-tile coherence directory with optional directory cache
- mc: memory controller with a full DRAM bank/timing model
- noc: crossbar / 2-D mesh / ring interconnects
- o3core: out-of-order core and branch predictor
- tlb: fully-associative LRU translation cache
- machine: the facade owning and wiring all of the above

In tests, shared fixtures are available under `crate::test_utils`.
"#]

pub mod cache;
pub mod directory;
pub mod event;
pub mod machine;
pub mod mc;
pub mod message;
pub mod noc;
pub mod o3core;
pub mod params;
pub mod tlb;

// Re-export the commonly used types at the crate root for convenience.
pub use machine::Machine;
pub use message::{CohState, CompId, CompKind, Message, MsgKind};
pub use params::{ConfigError, Params};

// Shared test utilities (only compiled for tests)
#[cfg(test)]
pub mod test_utils;
