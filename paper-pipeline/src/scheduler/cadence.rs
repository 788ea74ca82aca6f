use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Longest DST gap searched past a nonexistent local time.
const MAX_GAP_MINUTES: i64 = 180;

/// A daily `HH:00` slot in one IANA timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyCadence {
    tz: Tz,
    target: NaiveTime,
}

impl DailyCadence {
    /// Returns `None` when `hour` is outside 0–23.
    #[must_use]
    pub fn new(tz: Tz, hour: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, 0, 0).map(|target| Self { tz, target })
    }

    #[must_use]
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// 次回の実行時刻。`now` と同時刻の場合は翌日のスロットを返す。
    ///
    /// 夏時間で存在しない時刻は直後の有効な時刻に、重複する時刻は早い方に解決する。
    #[must_use]
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = now.with_timezone(&self.tz).date_naive();
        loop {
            if let Some(candidate) = self.resolve(date.and_time(self.target)) {
                if candidate > now {
                    return candidate;
                }
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => return now,
            };
        }
    }

    fn resolve(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        (0..=MAX_GAP_MINUTES).find_map(|offset| {
            match self.tz.from_local_datetime(&(local + Duration::minutes(offset))) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                    Some(dt.with_timezone(&Utc))
                }
                LocalResult::None => None,
            }
        })
    }
}
