//! Implementation of the work stealing scheduler.

pub(crate) mod pool;
pub(crate) use pool::ThreadPool;

pub(crate) mod queue;

pub(crate) mod shared;
pub(crate) use shared::{Seat, Shared};

pub(crate) mod worker;
pub(crate) use worker::Worker;
