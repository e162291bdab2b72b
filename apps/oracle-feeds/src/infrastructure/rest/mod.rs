//! REST Strategy
//!
//! Interval-driven polling: the orchestrator plans and paces tasks, the
//! fetcher turns each task into one HTTP call, and the transports perform it
//! against a single endpoint or a set of redundant ones.

mod fanout;
mod fetcher;
mod orchestrator;
mod transport;

pub use fanout::{FanOutTransport, ResponseFilter, first_response, freshest_by_header};
pub use fetcher::RestFetcher;
pub use orchestrator::{RestQueryHandler, plan_tasks};
pub use transport::DirectTransport;
