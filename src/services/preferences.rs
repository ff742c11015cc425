//! Preference evaluator: decides, for one (user, type, channel, priority) at
//! a given wall-clock, whether a notification is sent now, blocked, or
//! deferred into the user's daily/weekly digest.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;

use crate::db::models::{Channel, Frequency, NotificationType, Priority, UserPreference};
use crate::db::repository::PreferenceRepository;
use crate::error::AppResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Send,
    Block { reason: String },
    DeferToBatch,
}

/// Evaluate against the stored preference, or the built-in defaults when the
/// user has no record for this (type, channel).
pub async fn evaluate(
    pool: &SqlitePool,
    user_id: &str,
    ntype: NotificationType,
    channel: Channel,
    priority: Priority,
    now: DateTime<Utc>,
) -> AppResult<Decision> {
    if priority.bypasses_preferences() {
        return Ok(Decision::Send);
    }

    let stored = PreferenceRepository::get(pool, user_id, ntype, channel).await?;
    let from_store = stored.is_some();
    let pref = stored.unwrap_or_else(|| UserPreference::default_for(user_id, ntype, channel));

    Ok(decide(&pref, from_store, priority, now))
}

/// Rule order (first match wins): urgent bypass is handled by the caller,
/// then disabled flag, disabled frequency, quiet hours, batching.
pub fn decide(
    pref: &UserPreference,
    from_store: bool,
    priority: Priority,
    now: DateTime<Utc>,
) -> Decision {
    if priority.bypasses_preferences() {
        return Decision::Send;
    }

    if !pref.enabled {
        let reason = if from_store {
            "disabled by user"
        } else {
            "disabled by default"
        };
        return Decision::Block {
            reason: reason.to_string(),
        };
    }

    let frequency = pref.frequency();
    if frequency == Frequency::Disabled {
        return Decision::Block {
            reason: "frequency disabled".to_string(),
        };
    }

    if let Some((start, end)) = pref.quiet_window() {
        if !priority.ignores_quiet_hours() && in_quiet_window(local_time(pref, now), start, end) {
            return Decision::Block {
                reason: "quiet hours".to_string(),
            };
        }
    }

    match frequency {
        Frequency::Daily | Frequency::Weekly => Decision::DeferToBatch,
        _ => Decision::Send,
    }
}

/// Wall-clock in the user's time zone; unknown zone names fall back to UTC.
pub fn local_time(pref: &UserPreference, now: DateTime<Utc>) -> NaiveTime {
    let tz: Tz = pref.time_zone.parse().unwrap_or(chrono_tz::UTC);
    now.with_timezone(&tz).time()
}

/// Membership in [start, end), supporting windows that wrap past midnight.
fn in_quiet_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t < end
    } else {
        t >= start || t < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pref(
        enabled: bool,
        frequency: Frequency,
        quiet: Option<(&str, &str)>,
        tz: &str,
    ) -> UserPreference {
        let mut p = UserPreference::default_for("u1", NotificationType::Message, Channel::Email);
        p.enabled = enabled;
        p.frequency = frequency.as_str().to_string();
        if let Some((start, end)) = quiet {
            p.quiet_start = Some(start.to_string());
            p.quiet_end = Some(end.to_string());
        }
        p.time_zone = tz.to_string();
        p
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, h, m, 0).unwrap()
    }

    #[test]
    fn urgent_and_critical_bypass_everything() {
        let p = pref(false, Frequency::Disabled, Some(("00:00", "23:59")), "UTC");
        assert_eq!(decide(&p, true, Priority::Urgent, at(3, 0)), Decision::Send);
        assert_eq!(decide(&p, true, Priority::Critical, at(3, 0)), Decision::Send);
    }

    #[test]
    fn disabled_reason_differs_for_defaults() {
        let p = pref(false, Frequency::Immediate, None, "UTC");
        assert_eq!(
            decide(&p, true, Priority::Normal, at(12, 0)),
            Decision::Block {
                reason: "disabled by user".to_string()
            }
        );
        assert_eq!(
            decide(&p, false, Priority::Normal, at(12, 0)),
            Decision::Block {
                reason: "disabled by default".to_string()
            }
        );
    }

    #[test]
    fn disabled_frequency_blocks() {
        let p = pref(true, Frequency::Disabled, None, "UTC");
        assert_eq!(
            decide(&p, true, Priority::Normal, at(12, 0)),
            Decision::Block {
                reason: "frequency disabled".to_string()
            }
        );
    }

    #[test]
    fn quiet_hours_block_normal_not_high() {
        let p = pref(true, Frequency::Immediate, Some(("22:00", "07:00")), "UTC");
        // 23:30 inside the wrapped window.
        assert_eq!(
            decide(&p, true, Priority::Normal, at(23, 30)),
            Decision::Block {
                reason: "quiet hours".to_string()
            }
        );
        // 03:00 also inside.
        assert_eq!(
            decide(&p, true, Priority::Low, at(3, 0)),
            Decision::Block {
                reason: "quiet hours".to_string()
            }
        );
        // High priority ignores quiet hours.
        assert_eq!(decide(&p, true, Priority::High, at(3, 0)), Decision::Send);
        // 12:00 outside the window.
        assert_eq!(decide(&p, true, Priority::Normal, at(12, 0)), Decision::Send);
    }

    #[test]
    fn quiet_window_boundaries_are_half_open() {
        let p = pref(true, Frequency::Immediate, Some(("22:00", "07:00")), "UTC");
        // Start is inclusive.
        assert_eq!(
            decide(&p, true, Priority::Normal, at(22, 0)),
            Decision::Block {
                reason: "quiet hours".to_string()
            }
        );
        // End is exclusive.
        assert_eq!(decide(&p, true, Priority::Normal, at(7, 0)), Decision::Send);
    }

    #[test]
    fn quiet_hours_use_user_timezone() {
        // 20:00 UTC is 22:00 in Cairo (UTC+2): inside a 21:00-23:00 window.
        let p = pref(
            true,
            Frequency::Immediate,
            Some(("21:00", "23:00")),
            "Africa/Cairo",
        );
        assert_eq!(
            decide(&p, true, Priority::Normal, at(20, 0)),
            Decision::Block {
                reason: "quiet hours".to_string()
            }
        );
        // Same instant evaluated as UTC would be outside the window.
        let p_utc = pref(true, Frequency::Immediate, Some(("21:00", "23:00")), "UTC");
        assert_eq!(decide(&p_utc, true, Priority::Normal, at(20, 0)), Decision::Send);
    }

    #[test]
    fn daily_and_weekly_defer_to_batch() {
        let p = pref(true, Frequency::Daily, None, "UTC");
        assert_eq!(
            decide(&p, true, Priority::Normal, at(12, 0)),
            Decision::DeferToBatch
        );
        let p = pref(true, Frequency::Weekly, None, "UTC");
        assert_eq!(
            decide(&p, true, Priority::Normal, at(12, 0)),
            Decision::DeferToBatch
        );
    }

    #[tokio::test]
    async fn marketing_without_record_blocks_by_default() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let decision = evaluate(
            &pool,
            "u3",
            NotificationType::Marketing,
            Channel::Email,
            Priority::Normal,
            at(12, 0),
        )
        .await
        .unwrap();
        assert_eq!(
            decision,
            Decision::Block {
                reason: "disabled by default".to_string()
            }
        );
    }
}
