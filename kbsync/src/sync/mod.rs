pub mod apply;
pub mod clock;
pub mod diff;
pub mod engine;
pub mod enumerate;
pub mod file_types;
pub mod ledger;
pub mod remote;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;
