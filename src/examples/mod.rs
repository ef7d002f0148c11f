//! Example optical systems used by tests and benchmarks.
pub mod biconvex_finite;
pub mod convexplano_lens;
pub mod tilted_stop;
