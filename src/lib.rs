pub mod action;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod queue;
pub mod results;
pub mod shell;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_utils;
