/*!
A discrete-event simulator of a workflow scheduler that arbitrates shared
access to a fleet of network devices.

Each workflow names the devices it needs by a regular expression over
device identifiers and asks for read (shared) or write (exclusive) access.
The scheduler grants those accesses respecting mutual exclusion on every
matched device while keeping concurrency high, avoiding starvation and
recovering from deadlocks by rollback.

## Pieces

- [`fsm`] — deterministic automata over device identifiers with the full
  set algebra (containment, disjointness, intersection, difference) and a
  regex renderer.
- [`resolver`] — the device/datacenter universe, the startup caches and
  the device-count shortcuts for set relations.
- [`tree`] — the containment tree: regex-denoted nodes ordered by language
  containment, with splitting insertion and lock-preserving re-grants.
- [`sched`] — the six scheduler variants: per-device and per-datacenter
  baselines and the regex-tree engines, each under a FIFO or a
  dependency-set-maximizing candidate policy, plus deadlock rollback.
- [`events`], [`runner`] — the `(time, seq)` event heap and the loop that
  drains it, with the result writers.
- [`workload`], [`config`] — trace loading and run configuration.

## Running a simulation

```no_run
use occam_sim::{Runner, SimConfig};

let cfg = SimConfig::builder()
    .folder("lessdc")
    .num_wf(100)
    .build();
let mut runner = Runner::from_config(&cfg)?;
let summary = runner.run()?;
runner.write_outputs()?;
println!("completed {} workflows", summary.completions);
# Ok::<(), occam_sim::SimError>(())
```

The simulator is single-threaded and cooperatively serial: every state
mutation is driven by the event loop popping one event at a time, and the
simulated concurrency lives entirely in the model.
*/

pub mod config;
pub mod error;
pub mod events;
pub mod fsm;
pub mod resolver;
pub mod runner;
pub mod sched;
pub mod tree;
pub mod workflow;
pub mod workload;

pub use config::SimConfig;
pub use error::{Result, SimError};
pub use resolver::Resolver;
pub use runner::{RunSummary, Runner};
pub use sched::{Policy, SchedulerKind};
