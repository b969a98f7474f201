//! Cluster Integration Test Suite
//!
//! End-to-end tests of transactions over an in-process cluster: snapshot
//! isolation, lock and lease behaviour, failure handling, iteration and
//! version GC.
//!
//! Most tests build clusters with manual epochs so snapshot numbers move
//! only when the test advances them.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test cluster
//! cargo test --test cluster scenarios::
//! ```

mod common;

mod backends;
mod failures;
mod gc;
mod iterator;
mod leases;
mod locking;
mod scenarios;
