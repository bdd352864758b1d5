//! Daily grader load: fetch learner attempts from the statistics API,
//! validate them, replace the attempts table with the new batch, compute the
//! daily metrics and publish them.

pub mod config;
pub mod db;
pub mod fetch;
pub mod google_auth;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod prepare;
pub mod publish;
pub mod store;
pub mod validate;
