//! Unit test harness

mod test_envelope;
mod test_ledger;
mod test_logstore;
mod test_paths;
mod test_registry;
