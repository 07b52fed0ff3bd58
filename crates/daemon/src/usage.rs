//! Credit gate: a fixed number of generations per user per 30-day window.

use std::str::FromStr;

use builder_core::api::UsageStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Points one generation costs.
pub const GENERATION_COST: u32 = 1;

/// Window length, measured from the first consumption in it.
pub const WINDOW_MS: i64 = 30 * 24 * 60 * 60 * 1_000;

/// Subscription plan of the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Plan {
    #[default]
    Free,
    Pro,
    ClaudePro,
    ExtendedClaudePro,
}

impl Plan {
    /// Points per window.
    pub fn points(&self) -> u32 {
        match self {
            Plan::Free => 2,
            Plan::Pro => 100,
            Plan::ClaudePro => 30,
            Plan::ExtendedClaudePro => 100,
        }
    }
}

impl FromStr for Plan {
    type Err = std::convert::Infallible;

    /// Unknown plan names fall back to the free tier.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "pro" => Plan::Pro,
            "claude_pro" => Plan::ClaudePro,
            "extended_claude_pro" => Plan::ExtendedClaudePro,
            _ => Plan::Free,
        })
    }
}

/// Stored consumption for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub user_id: String,
    pub consumed_points: u32,
    pub window_expires_at_ms: i64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("You have run out of credits")]
    Exhausted { ms_before_next: i64 },
}

/// Consume `cost` points. Returns the record to store.
pub fn consume(
    record: Option<UsageRecord>,
    user_id: &str,
    plan: Plan,
    cost: u32,
    now_ms: i64,
) -> Result<UsageRecord, UsageError> {
    let current = record.filter(|r| r.window_expires_at_ms > now_ms);
    let (consumed, expires) = match &current {
        Some(r) => (r.consumed_points, r.window_expires_at_ms),
        None => (0, now_ms + WINDOW_MS),
    };

    let next = consumed.saturating_add(cost);
    if next > plan.points() {
        return Err(UsageError::Exhausted {
            ms_before_next: expires - now_ms,
        });
    }

    Ok(UsageRecord {
        user_id: user_id.to_string(),
        consumed_points: next,
        window_expires_at_ms: expires,
    })
}

/// Usage snapshot for display.
pub fn status(record: Option<&UsageRecord>, plan: Plan, now_ms: i64) -> UsageStatus {
    match record.filter(|r| r.window_expires_at_ms > now_ms) {
        Some(r) => UsageStatus {
            remaining_points: plan.points().saturating_sub(r.consumed_points),
            consumed_points: r.consumed_points,
            ms_before_next: r.window_expires_at_ms - now_ms,
        },
        None => UsageStatus {
            remaining_points: plan.points(),
            consumed_points: 0,
            ms_before_next: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_points() {
        assert_eq!("pro".parse::<Plan>().unwrap().points(), 100);
        assert_eq!("claude_pro".parse::<Plan>().unwrap().points(), 30);
        assert_eq!("extended_claude_pro".parse::<Plan>().unwrap().points(), 100);
        assert_eq!("".parse::<Plan>().unwrap(), Plan::Free);
        assert_eq!("enterprise".parse::<Plan>().unwrap().points(), 2);
    }

    #[test]
    fn free_tier_allows_two_generations() {
        let now = 1_000;
        let first = consume(None, "u1", Plan::Free, GENERATION_COST, now).unwrap();
        let second = consume(Some(first), "u1", Plan::Free, GENERATION_COST, now + 1).unwrap();
        assert_eq!(second.consumed_points, 2);

        let err = consume(Some(second), "u1", Plan::Free, GENERATION_COST, now + 2).unwrap_err();
        assert_eq!(
            err,
            UsageError::Exhausted {
                ms_before_next: WINDOW_MS - 2
            }
        );
    }

    #[test]
    fn window_resets_after_expiry() {
        let exhausted = UsageRecord {
            user_id: "u1".into(),
            consumed_points: 2,
            window_expires_at_ms: 5_000,
        };
        let fresh = consume(Some(exhausted), "u1", Plan::Free, 1, 5_000).unwrap();
        assert_eq!(fresh.consumed_points, 1);
        assert_eq!(fresh.window_expires_at_ms, 5_000 + WINDOW_MS);
    }

    #[test]
    fn status_reports_remaining() {
        let record = UsageRecord {
            user_id: "u1".into(),
            consumed_points: 7,
            window_expires_at_ms: 10_000,
        };
        let st = status(Some(&record), Plan::ClaudePro, 4_000);
        assert_eq!(st.remaining_points, 23);
        assert_eq!(st.consumed_points, 7);
        assert_eq!(st.ms_before_next, 6_000);

        let st = status(None, Plan::Pro, 4_000);
        assert_eq!(st.remaining_points, 100);
        assert_eq!(st.ms_before_next, 0);
    }
}
