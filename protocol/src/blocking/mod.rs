//! Human-intervention halts.

pub mod manager;
pub mod record;

pub use manager::{
    check_timeout, BlockingConfig, BlockingError, BlockingManager, Resolution, TimeoutAction,
    TimeoutOutcome, TimeoutStatus, TimeoutStrategy, BLOCKING_TIMEOUT_CODE, TIMEOUT_FAIL_RESOLUTION,
};
pub use record::BlockingRecord;
