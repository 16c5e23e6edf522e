use chrono::{Datelike, NaiveDate};
use serde::Serialize;

/// Months in fiscal order. The fiscal year starts in April.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FiscalMonth {
    April,
    May,
    June,
    July,
    August,
    September,
    October,
    November,
    December,
    January,
    February,
    March,
}

impl FiscalMonth {
    pub const ALL: [FiscalMonth; 12] = [
        FiscalMonth::April,
        FiscalMonth::May,
        FiscalMonth::June,
        FiscalMonth::July,
        FiscalMonth::August,
        FiscalMonth::September,
        FiscalMonth::October,
        FiscalMonth::November,
        FiscalMonth::December,
        FiscalMonth::January,
        FiscalMonth::February,
        FiscalMonth::March,
    ];

    pub fn position(self) -> usize {
        self as usize
    }

    pub fn column(self) -> &'static str {
        match self {
            FiscalMonth::April => "april",
            FiscalMonth::May => "may",
            FiscalMonth::June => "june",
            FiscalMonth::July => "july",
            FiscalMonth::August => "august",
            FiscalMonth::September => "september",
            FiscalMonth::October => "october",
            FiscalMonth::November => "november",
            FiscalMonth::December => "december",
            FiscalMonth::January => "january",
            FiscalMonth::February => "february",
            FiscalMonth::March => "march",
        }
    }

    pub fn from_calendar_month(month: u32) -> Option<Self> {
        if !(1..=12).contains(&month) {
            return None;
        }
        let position = (month as usize + 8) % 12;
        Some(Self::ALL[position])
    }

    /// Parses attendance month labels such as "June", "jun" or "June 2026".
    pub fn parse_label(label: &str) -> Option<Self> {
        let token = label.split_whitespace().next()?.to_lowercase();
        Self::ALL.into_iter().find(|month| {
            let column = month.column();
            token == column || (token.len() == 3 && column.starts_with(token.as_str()))
        })
    }
}

/// Fiscal month number for YTD target pro-rating: April = 1 through
/// December = 9, with January to March capped at 10.
pub fn month_index(date: NaiveDate) -> i32 {
    let month = date.month() as i32;
    if month >= 4 {
        month - 3
    } else {
        (month + 9).min(10)
    }
}

pub fn fiscal_year_of(date: NaiveDate) -> i32 {
    if date.month() >= 4 {
        date.year()
    } else {
        date.year() - 1
    }
}

pub fn fiscal_year_bounds(fiscal_year: i32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(fiscal_year, 4, 1)?;
    let end = NaiveDate::from_ymd_opt(fiscal_year + 1, 3, 31)?;
    Some((start, end))
}
