//! This crate has no library surface of its own. It exists to hold the
//! end-to-end scenario tests (`tests/scenarios.rs`) and cross-cutting
//! property tests (`tests/properties.rs`) that exercise `broker-core`'s
//! `Lifecycle`/`Scheduler`/`AgentRegistry` stack over `broker-mocks`'s
//! in-memory `Store`, independent of the HTTP surface already covered by
//! `broker-protocol`'s own integration tests.
