//! Word-Count Pipeline Module
//!
//! The three roles that turn a segmented document into a word histogram. They
//! only talk to each other through queues on a [`Transport`](crate::broker::transport::Transport),
//! so they can share one process or run on separate hosts.
//!
//! ## Flow
//! 1. **Dispatcher**: publishes each work unit, tagged `<run_id>:<seq>`, to the task queue,
//!    then waits on the response queue for the histogram tagged with its run id.
//! 2. **Counting workers**: turn each unit into a partial count and publish it to the
//!    partial-result queue before acknowledging the unit.
//! 3. **Merge aggregator**: sums partial counts; the sentinel's partial triggers
//!    the final histogram, which goes to the response queue tagged with the run id.
//!
//! [`local::run_local`] runs all three in one process and fails the run if a role stops early.
//!
//! Every consumer uses a prefetch of one. Delivery is at least once; the aggregator
//! skips partials whose unit id it already merged in the current run.

pub mod aggregator;
pub mod dispatcher;
pub mod local;
pub mod types;
pub mod worker;

#[cfg(test)]
mod tests;
