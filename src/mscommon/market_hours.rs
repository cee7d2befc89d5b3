//! 市场交易时段时钟模块
//!
//! 判断任意时刻标的市场是否开盘，为连接监督器提供闭市休眠。
//! 固定时区内的工作日窗口 + 美股假日表；时区配置异常时视为闭市（故障安全）。

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// 市场时钟日志目标
const MARKET_CLOCK_TARGET: &str = "市场时钟";

/// 交易时段：9:30 - 16:00（美东时间），周一至周五
const MARKET_TZ: &str = "America/New_York";
const OPEN_HOUR: u32 = 9;
const OPEN_MINUTE: u32 = 30;
const CLOSE_HOUR: u32 = 16;
const CLOSE_MINUTE: u32 = 0;

/// 美股主要假日 (月, 日)
const MARKET_HOLIDAYS_2025: [(u32, u32); 9] = [
    (1, 1),
    (1, 20),
    (2, 17),
    (4, 18),
    (5, 26),
    (7, 4),
    (9, 1),
    (11, 27),
    (12, 25),
];

const MARKET_HOLIDAYS_2026: [(u32, u32); 9] = [
    (1, 1),
    (1, 19),
    (2, 16),
    (4, 3),
    (5, 25),
    (7, 3),
    (9, 7),
    (11, 26),
    (12, 25),
];

/// 其他年份只检查固定日期假日
const FIXED_HOLIDAYS: [(u32, u32); 3] = [(1, 1), (7, 4), (12, 25)];

/// 市场时段时钟
///
/// `skip_hours` 为真时强制视为永远开盘（测试模式）。
#[derive(Debug, Clone)]
pub struct MarketHoursClock {
    skip_hours: bool,
}

impl MarketHoursClock {
    pub fn new(skip_hours: bool) -> Self {
        if skip_hours {
            warn!(target: MARKET_CLOCK_TARGET, "已跳过市场时段检查，视为永远开盘（测试模式）");
        }
        Self { skip_hours }
    }

    /// 判断给定时刻市场是否开盘
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if self.skip_hours {
            return true;
        }

        let tz: Tz = match MARKET_TZ.parse() {
            Ok(tz) => tz,
            Err(e) => {
                // 故障安全：时区解析失败视为闭市
                warn!(target: MARKET_CLOCK_TARGET, error = %e, "时区解析失败，按闭市处理");
                return false;
            }
        };

        let local = now.with_timezone(&tz);

        if is_holiday(local.year(), local.month(), local.day()) {
            return false;
        }

        match local.weekday() {
            Weekday::Sat | Weekday::Sun => return false,
            _ => {}
        }

        let minutes = local.hour() * 60 + local.minute();
        let open_minutes = OPEN_HOUR * 60 + OPEN_MINUTE;
        let close_minutes = CLOSE_HOUR * 60 + CLOSE_MINUTE;
        minutes >= open_minutes && minutes < close_minutes
    }

    /// 计算给定时刻之后的下一次开盘时间
    pub fn next_open_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.skip_hours {
            return now;
        }

        let tz: Tz = match MARKET_TZ.parse() {
            Ok(tz) => tz,
            Err(_) => return now + ChronoDuration::minutes(5),
        };

        let local = now.with_timezone(&tz);
        let open_time = NaiveTime::from_hms_opt(OPEN_HOUR, OPEN_MINUTE, 0)
            .expect("固定开盘时间常量有效");

        // 从今天起向后最多找14天，跳过周末与假日
        for days_ahead in 0..14 {
            let date = local.date_naive() + ChronoDuration::days(days_ahead);
            let weekday = date.weekday();
            if weekday == Weekday::Sat || weekday == Weekday::Sun {
                continue;
            }
            if is_holiday(date.year(), date.month(), date.day()) {
                continue;
            }
            if let Some(open_local) = tz.from_local_datetime(&date.and_time(open_time)).single() {
                let open_utc = open_local.with_timezone(&Utc);
                if open_utc > now {
                    return open_utc;
                }
            }
        }

        // 不应该到这里；兜底5分钟后重查
        now + ChronoDuration::minutes(5)
    }

    /// 阻塞等待到下一次开盘，每次休眠不超过5分钟以便周期性复查
    ///
    /// `running` 置为false时提前返回。
    pub async fn block_until_open(&self, running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            let now = Utc::now();
            if self.is_open(now) {
                return;
            }

            let next_open = self.next_open_after(now);
            let until_open = (next_open - now).num_seconds().max(1) as u64;
            let sleep_secs = until_open.min(super::config::constants::MARKET_RECHECK_MAX_SECS);
            info!(
                target: MARKET_CLOCK_TARGET,
                next_open = %next_open,
                sleep_secs,
                "市场闭市，休眠等待开盘"
            );
            sleep(Duration::from_secs(sleep_secs)).await;
        }
    }
}

fn is_holiday(year: i32, month: u32, day: u32) -> bool {
    let date = (month, day);
    match year {
        2025 => MARKET_HOLIDAYS_2025.contains(&date),
        2026 => MARKET_HOLIDAYS_2026.contains(&date),
        _ => FIXED_HOLIDAYS.contains(&date),
    }
}
