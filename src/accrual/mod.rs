pub mod client;
pub mod poller;
pub mod queue;
pub mod retry;
pub mod sweep;
