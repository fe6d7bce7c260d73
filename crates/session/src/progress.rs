use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GoalId, UserId};

/// A learning goal tracked as `current` out of `target` units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub user_id: UserId,
    pub title: String,
    pub current: u64,
    pub target: u64,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Goal {
    pub fn new(user_id: UserId, title: impl Into<String>, target: u64) -> Self {
        Self {
            id: GoalId::new(),
            user_id,
            title: title.into(),
            current: 0,
            target,
            deadline: None,
            completed_at: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whole-number percentage, capped at 100
    pub fn progress_percent(&self) -> u8 {
        if self.target == 0 {
            return 100;
        }
        let percent = (self.current as u128 * 100) / self.target as u128;
        percent.min(100) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.target
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_complete() && self.deadline.map(|d| now > d).unwrap_or(false)
    }

    /// Add progress; returns true when this call completed the goal
    pub fn record(&mut self, amount: u64) -> bool {
        let was_complete = self.is_complete();
        self.current = self.current.saturating_add(amount);
        if !was_complete && self.is_complete() {
            self.completed_at = Some(Utc::now());
            return true;
        }
        false
    }
}
