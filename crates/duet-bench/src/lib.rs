//! Benchmarks for Duet.
//!
//! Run the criterion suites with `cargo bench -p duet-bench`, or drive a
//! running server with the `e2e_throughput` binary.
