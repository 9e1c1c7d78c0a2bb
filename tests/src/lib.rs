//! # xa-link Test Suite
//!
//! Cross-node scenarios run against several enlistment nodes sharing one
//! in-memory transport.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/
//! │   └── commit_benchmarks.rs   # Commit latency by branch count
//! └── src/integration/
//!     ├── cluster.rs             # Node wiring shared by every scenario
//!     ├── flows.rs               # Commit, rollback, timeout, messaging flows
//!     ├── recovery.rs            # In-doubt branches and heuristics
//!     └── properties.rs          # Randomized all-or-nothing checks
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p xa-tests
//!
//! # By category
//! cargo test -p xa-tests integration::flows::
//! cargo test -p xa-tests integration::recovery::
//!
//! # Benchmarks
//! cargo bench -p xa-tests
//! ```

pub mod integration;
