//! A scheduler for pods whose virtual machine runs on an external cloud.
//!
//! Pods are taken off a [`SchedulingQueue`](queue::SchedulingQueue) one at a time. The
//! [`ScheduleAlgorithm`](algorithm::ScheduleAlgorithm) picks a cloud host, and a task per
//! scheduled pod creates the server there and polls it until it is active. A pod whose server
//! fails is rescheduled a bounded number of times before it is marked failed.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod algorithm;
pub mod condition;
pub mod config;
mod error;
pub mod queue;
mod scheduler;

pub use error::ScheduleError;
pub use scheduler::{server_request, ScheduledPod, Scheduler};
