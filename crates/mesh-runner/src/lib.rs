//! # mesh-runner
//!
//! Process supervision for the agent mesh.
//!
//! ## Architecture
//!
//! ```text
//!             ┌────────────────────────────┐
//!  config ──► │ Supervisor::start          │
//!             │  1. build agents           │
//!             │  2. free declared ports    │
//!             │  3. provision endpoints    │
//!             │  4. wait for connections   │
//!             │  5. one task per agent     │
//!             └─────────────┬──────────────┘
//!                           │ SIGINT / SIGTERM
//!                           ▼
//!             ┌────────────────────────────┐
//!             │ Supervisor::shutdown       │
//!             │  stop flags → grace wait   │
//!             │  → abort stragglers        │
//!             │  → close_all (once)        │
//!             └────────────────────────────┘
//! ```

pub mod signals;
pub mod supervisor;

pub use supervisor::{ShutdownSummary, Supervisor};
