use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default expense categories offered by the application.
pub const EXPENSE_CATEGORIES: [&str; 10] = [
    "Food & Dining",
    "Transportation",
    "Shopping",
    "Entertainment",
    "Bills & Utilities",
    "Health & Fitness",
    "Travel",
    "Education",
    "Personal Care",
    "Others",
];

// ============================================================================
// Month key
// ============================================================================

/// Calendar month in `YYYY-MM` form, the key budgets are tracked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    /// `None` unless `month` is 1..=12 and `year` is a year chrono can represent.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        let years = NaiveDate::MIN.year()..=NaiveDate::MAX.year();
        if (1..=12).contains(&month) && years.contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The month that contains "now" in UTC.
    pub fn current() -> Self {
        Self::of(Utc::now().date_naive())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        match self.next() {
            Some(next) => next.first_day().pred_opt().unwrap_or(NaiveDate::MAX),
            None => NaiveDate::MAX,
        }
    }

    /// The following month; `None` past the last month chrono can represent.
    pub fn next(&self) -> Option<Self> {
        if self.month == 12 {
            Self::new(self.year.checked_add(1)?, 1)
        } else {
            Self::new(self.year, self.month + 1)
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("invalid month '{}', expected YYYY-MM", s))?;
        let year = year
            .parse::<i32>()
            .map_err(|_| format!("invalid year in '{}'", s))?;
        let month = month
            .parse::<u32>()
            .map_err(|_| format!("invalid month in '{}'", s))?;
        Self::new(year, month).ok_or_else(|| format!("month out of range in '{}'", s))
    }
}

impl TryFrom<String> for YearMonth {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

// ============================================================================
// Entity records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    pub amount: f64,
    pub category: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub notes: String,
    /// Informational only; nothing gates on it.
    #[serde(default)]
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Expense {
    pub fn new(
        amount: f64,
        category: impl Into<String>,
        date: NaiveDate,
        notes: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            amount,
            category: category.into(),
            date,
            notes: notes.into(),
            synced: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn month(&self) -> YearMonth {
        YearMonth::of(self.date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub id: String,
    pub category: String,
    pub monthly_limit: f64,
    pub month: YearMonth,
    /// Cached sum of matching expenses; may be stale until recomputed.
    #[serde(default)]
    pub spent: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    pub fn new(category: impl Into<String>, monthly_limit: f64, month: YearMonth) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            category: category.into(),
            monthly_limit,
            month,
            spent: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `expense` counts toward this budget.
    pub fn covers(&self, expense: &Expense) -> bool {
        expense.category == self.category && self.month.contains(expense.date)
    }
}

// ============================================================================
// Outbox
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Expense,
    Budget,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expense => write!(f, "expense"),
            Self::Budget => write!(f, "budget"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A mutation waiting to be confirmed by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub entity_type: EntityType,
    pub action: SyncAction,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(entity_type: EntityType, action: SyncAction, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: new_outbox_id(now),
            entity_type,
            action,
            payload,
            enqueued_at: now,
        }
    }
}

/// `sync_<unix millis>_<9 random chars>`
fn new_outbox_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("sync_{}_{}", now.timestamp_millis(), &random[..9])
}
