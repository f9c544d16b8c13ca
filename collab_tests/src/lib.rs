//! Integration test crate; see `tests/` for the suites.
