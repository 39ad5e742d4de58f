//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 订阅者的消费位置。

use crate::backend::store::LogPosition;
use std::sync::{Mutex, PoisonError};

/// 订阅者最后消费的位置，只会前进
#[derive(Debug)]
pub struct SyncCursor {
    position: Mutex<LogPosition>,
}

impl SyncCursor {
    pub fn new(start: LogPosition) -> Self {
        Self {
            position: Mutex::new(start),
        }
    }

    pub fn position(&self) -> LogPosition {
        *self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 前进到 `position`，比当前位置旧时忽略并返回 false
    pub fn advance(&self, position: LogPosition) -> bool {
        let mut current = self.position.lock().unwrap_or_else(PoisonError::into_inner);
        if position > *current {
            *current = position;
            true
        } else {
            false
        }
    }
}
