//! Budget threshold evaluation. Pure; no I/O.

use super::capabilities::Notification;
use crate::core::{Budget, YearMonth};

pub const NEAR_LIMIT_PERCENT: f64 = 80.0;
pub const EXCEEDED_PERCENT: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub enum BudgetAlert {
    NearLimit {
        budget_id: String,
        category: String,
        percentage: f64,
    },
    Exceeded {
        budget_id: String,
        category: String,
        percentage: f64,
        overspend: f64,
    },
}

impl BudgetAlert {
    pub fn budget_id(&self) -> &str {
        match self {
            BudgetAlert::NearLimit { budget_id, .. } | BudgetAlert::Exceeded { budget_id, .. } => {
                budget_id
            }
        }
    }

    pub fn category(&self) -> &str {
        match self {
            BudgetAlert::NearLimit { category, .. } | BudgetAlert::Exceeded { category, .. } => {
                category
            }
        }
    }

    pub fn percentage(&self) -> f64 {
        match self {
            BudgetAlert::NearLimit { percentage, .. } | BudgetAlert::Exceeded { percentage, .. } => {
                *percentage
            }
        }
    }

    pub fn is_exceeded(&self) -> bool {
        matches!(self, BudgetAlert::Exceeded { .. })
    }
}

/// `None` below 80%, near limit in `[80, 100)`, exceeded at 100% and above.
/// A non-positive limit never alerts.
pub fn evaluate_budget(budget: &Budget) -> Option<BudgetAlert> {
    if budget.monthly_limit <= 0.0 || !budget.monthly_limit.is_finite() {
        return None;
    }
    let percentage = budget.spent / budget.monthly_limit * 100.0;
    if percentage >= EXCEEDED_PERCENT {
        Some(BudgetAlert::Exceeded {
            budget_id: budget.id.clone(),
            category: budget.category.clone(),
            percentage,
            overspend: budget.spent - budget.monthly_limit,
        })
    } else if percentage >= NEAR_LIMIT_PERCENT {
        Some(BudgetAlert::NearLimit {
            budget_id: budget.id.clone(),
            category: budget.category.clone(),
            percentage,
        })
    } else {
        None
    }
}

/// Alerts for budgets of `month`, in input order.
pub fn evaluate_budgets(budgets: &[Budget], month: YearMonth) -> Vec<BudgetAlert> {
    budgets
        .iter()
        .filter(|budget| budget.month == month)
        .filter_map(evaluate_budget)
        .collect()
}

pub fn alert_notification(alert: &BudgetAlert) -> Notification {
    let (title, body) = match alert {
        BudgetAlert::NearLimit {
            category,
            percentage,
            ..
        } => (
            format!("Budget Alert: {}", category),
            format!(
                "You've spent {:.0}% of your {} budget this month.",
                percentage, category
            ),
        ),
        BudgetAlert::Exceeded {
            category,
            overspend,
            ..
        } => (
            format!("Budget Exceeded: {}", category),
            format!("You've exceeded your {} budget by ${:.2}.", category, overspend),
        ),
    };
    Notification {
        title,
        body,
        tag: format!("budget-{}", alert.budget_id()),
    }
}
