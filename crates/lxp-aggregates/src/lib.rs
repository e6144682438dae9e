//! Aggregate layer: transactional write boundaries over the repositories.
//!
//! Every aggregate method opens exactly one transaction via
//! [`base::execute_write`], which also classifies the outcome into the
//! canonical failure codes and feeds the observability hooks. Aggregates
//! never hand the transaction to callers and never call each other inside
//! a transaction.

pub mod base;
pub mod saga;
pub mod thread;

pub use base::{execute_write, AggregateContract, Hooks, NoopHooks, TracingHooks};
pub use saga::{transition_allowed, AppendAction, SagaAggregate, TransitionStatus};
pub use thread::{AppendMessage, MarkTurnFailed, ThreadAggregate};
