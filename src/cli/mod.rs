//! Headless replay of counting events.
//!
//! Newline-delimited JSON `CountingEvent`s are fed to a `CountingProcessor`
//! backed by a `MemoryStore` seeded from settings. Processor events are
//! rendered by the output loop as they arrive.
//!
//! ```text
//! +-------------+     +-------------------+     +---------------+
//! | runner.rs   | --> | CountingProcessor | --> | output.rs     |
//! | (NDJSON in) |     | (observer chan)   |     | (print/JSON)  |
//! +-------------+     +-------------------+     +---------------+
//! ```

mod args;
mod bootstrap;
mod output;
mod runner;

pub use args::Args;
pub use bootstrap::{init_settings, initialize, CliContext};
pub use output::run_event_loop;
pub use runner::run;
