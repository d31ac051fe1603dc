//! "Is this listing from today?" classification over Arabic/English date text.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Datelike, Days, Local, NaiveDate};
use regex::Regex;

const TODAY_AR: &str = "اليوم";
const TODAY_EN: &str = "Today";

const MONTH_NAMES: &[(&str, u32)] = &[
    ("january", 1),
    ("jan", 1),
    ("february", 2),
    ("feb", 2),
    ("march", 3),
    ("mar", 3),
    ("april", 4),
    ("apr", 4),
    ("may", 5),
    ("june", 6),
    ("jun", 6),
    ("july", 7),
    ("jul", 7),
    ("august", 8),
    ("aug", 8),
    ("september", 9),
    ("sept", 9),
    ("sep", 9),
    ("october", 10),
    ("oct", 10),
    ("november", 11),
    ("nov", 11),
    ("december", 12),
    ("dec", 12),
    ("يناير", 1),
    ("فبراير", 2),
    ("مارس", 3),
    ("ابريل", 4),
    ("مايو", 5),
    ("يونيو", 6),
    ("يونيه", 6),
    ("يوليو", 7),
    ("يوليه", 7),
    ("اغسطس", 8),
    ("سبتمبر", 9),
    ("اكتوبر", 10),
    ("نوفمبر", 11),
    ("ديسمبر", 12),
    ("كانون الثاني", 1),
    ("شباط", 2),
    ("اذار", 3),
    ("نيسان", 4),
    ("ايار", 5),
    ("حزيران", 6),
    ("تموز", 7),
    ("اب", 8),
    ("ايلول", 9),
    ("تشرين الاول", 10),
    ("تشرين الثاني", 11),
    ("كانون الاول", 12),
];

static MONTH_LOOKUP: LazyLock<HashMap<&'static str, u32>> =
    LazyLock::new(|| MONTH_NAMES.iter().copied().collect());

static RE_MONTH_NAME: LazyLock<Regex> = LazyLock::new(|| {
    let mut names: Vec<&str> = MONTH_NAMES.iter().map(|(name, _)| *name).collect();
    names.sort_by_key(|n| std::cmp::Reverse(n.chars().count()));
    let alternation = names
        .iter()
        .map(|n| regex::escape(n))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"\b(?:{alternation})\b")).expect("invalid regex: month names")
});
static RE_YMD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})\b").expect("invalid regex: ymd")
});
static RE_DMY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[-/.](\d{1,2})[-/.](\d{4})\b").expect("invalid regex: dmy")
});
static RE_DAY_MONTH_YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})\s*@(\d{2})@\s*,?\s*(\d{4})\b").expect("invalid regex: day month year")
});
static RE_MONTH_DAY_YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@(\d{2})@\s*(\d{1,2})(?:st|nd|rd|th)?\s*,?\s*(\d{4})\b")
        .expect("invalid regex: month day year")
});
static RE_DAY_MONTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})\s*@(\d{2})@").expect("invalid regex: day month"));
static RE_MONTH_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@(\d{2})@\s*(\d{1,2})(?:st|nd|rd|th)?\b").expect("invalid regex: month day")
});
static RE_DAYS_AGO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d+)\s+days?\s+ago\b|منذ\s+(\d+)\s+(?:يوم|ايام)").expect("invalid regex: days ago")
});
static RE_YESTERDAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:yesterday|امس|البارحه)\b").expect("invalid regex: yesterday")
});
static RE_TOMORROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:tomorrow|غدا)\b").expect("invalid regex: tomorrow"));
static RE_HOURS_AGO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+\s+(?:hours?|minutes?|seconds?)\s+ago\b|منذ\s+\d*\s*(?:ساعه|ساعات|ساعتين|دقيقه|دقائق|دقيقتين|ثانيه|ثوان)")
        .expect("invalid regex: hours ago")
});

/// True when `text` denotes today's local calendar date.
pub fn is_today(text: &str) -> bool {
    is_today_on(text, Local::now().date_naive())
}

/// Same as [`is_today`] against an explicit reference date.
///
/// Literal "today" tokens short-circuit; otherwise the text must parse to a
/// calendar date equal to `today`. Unparseable or empty text is never today.
pub fn is_today_on(text: &str, today: NaiveDate) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return false;
    }
    if text.contains(TODAY_AR) || text.contains(TODAY_EN) {
        return true;
    }
    parse_date(text, today).is_some_and(|date| date == today)
}

/// Best-effort parse of Arabic or English date text to a calendar date.
///
/// Time-of-day is ignored. Dates without a year take `today`'s year. Literal
/// "today" words resolve to `today` here too, as [`is_today_on`] is not the
/// only caller.
pub fn parse_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return None;
    }

    if let Some(date) = parse_relative(&normalized, today) {
        return Some(date);
    }

    if let Some(caps) = RE_YMD.captures(&normalized) {
        return ymd(&caps[1], &caps[2], &caps[3]);
    }
    if let Some(caps) = RE_DMY.captures(&normalized) {
        return ymd(&caps[3], &caps[2], &caps[1]);
    }

    let marked = mark_month_names(&normalized);
    if let Some(caps) = RE_DAY_MONTH_YEAR.captures(&marked) {
        return ymd(&caps[3], &caps[2], &caps[1]);
    }
    if let Some(caps) = RE_MONTH_DAY_YEAR.captures(&marked) {
        return ymd(&caps[3], &caps[1], &caps[2]);
    }
    let year = today.year().to_string();
    if let Some(caps) = RE_DAY_MONTH.captures(&marked) {
        return ymd(&year, &caps[2], &caps[1]);
    }
    if let Some(caps) = RE_MONTH_DAY.captures(&marked) {
        return ymd(&year, &caps[1], &caps[2]);
    }
    None
}

fn parse_relative(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    if text.contains("today") || text.contains(TODAY_AR) || RE_HOURS_AGO.is_match(text) {
        return Some(today);
    }
    if RE_YESTERDAY.is_match(text) {
        return today.checked_sub_days(Days::new(1));
    }
    if RE_TOMORROW.is_match(text) {
        return today.checked_add_days(Days::new(1));
    }
    let caps = RE_DAYS_AGO.captures(text)?;
    let days: u64 = caps.get(1).or_else(|| caps.get(2))?.as_str().parse().ok()?;
    today.checked_sub_days(Days::new(days))
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

/// Replace each month name with an `@MM@` marker.
fn mark_month_names(text: &str) -> String {
    RE_MONTH_NAME
        .replace_all(text, |caps: &regex::Captures| {
            let month = MONTH_LOOKUP.get(&caps[0]).copied().unwrap_or_default();
            format!(" @{month:02}@ ")
        })
        .into_owned()
}

/// Lowercase, fold Arabic letter variants and map Eastern digits to ASCII.
fn normalize(text: &str) -> String {
    let folded: String = text
        .chars()
        .filter_map(|c| match c {
            '\u{0640}' | '\u{064B}'..='\u{0652}' => None,
            'أ' | 'إ' | 'آ' => Some('ا'),
            'ى' => Some('ي'),
            'ة' => Some('ه'),
            '،' => Some(','),
            '\u{0660}'..='\u{0669}' => char::from_digit(c as u32 - 0x0660, 10),
            '\u{06F0}'..='\u{06F9}' => char::from_digit(c as u32 - 0x06F0, 10),
            _ => Some(c),
        })
        .collect::<String>()
        .to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}
