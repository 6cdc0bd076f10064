/// Background task tests
///
/// Budget reminders, scheduled sync and cleanup running against a fully
/// wired application, with tokio's clock paused.
/// Run with: cargo test --test background_tasks_tests

use budgetsync::scheduler::{NoHostWakeup, Notification, tasks};
use budgetsync::{AppConfig, Budget, BudgetSync, ConnectionQuality, Expense, Notifier, YearMonth};
use chrono::Datelike;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Inbox {
    received: Mutex<Vec<Notification>>,
}

impl Notifier for Inbox {
    fn notify(&self, notification: &Notification) {
        self.received.lock().unwrap().push(notification.clone());
    }
}

fn this_month_day(day: u32) -> chrono::NaiveDate {
    YearMonth::current()
        .first_day()
        .with_day(day)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_reminder_fires_for_exceeded_budget() {
    let app = BudgetSync::open(AppConfig::default(), false).await.unwrap();
    let book = app.book();
    book.save_budget(Budget::new("Entertainment", 50.0, YearMonth::current()))
        .await
        .unwrap();
    book.save_expense(Expense::new(60.0, "Entertainment", this_month_day(2), "concert"))
        .await
        .unwrap();

    let inbox = Arc::new(Inbox::default());
    let background = app.start_background(inbox.clone(), Arc::new(NoHostWakeup));

    tokio::time::sleep(Duration::from_secs(29 * 60)).await;
    assert!(inbox.received.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    let received = inbox.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].title, "Budget Exceeded: Entertainment");
    assert_eq!(received[0].body, "You've exceeded your Entertainment budget by $10.00.");

    background.shutdown().await;
    app.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_sync_drains_once_online() {
    let app = BudgetSync::open(AppConfig::default(), false).await.unwrap();
    app.book()
        .save_expense(Expense::new(9.99, "Shopping", this_month_day(1), ""))
        .await
        .unwrap();
    assert_eq!(app.coordinator().outbox().len().await.unwrap(), 1);

    let background = app.start_background(Arc::new(Inbox::default()), Arc::new(NoHostWakeup));
    tokio::time::sleep(Duration::from_secs(6 * 60)).await;
    assert_eq!(app.coordinator().outbox().len().await.unwrap(), 1);
    assert_eq!(
        background.handle(tasks::DATA_SYNC).unwrap().iterations(),
        1
    );

    app.connectivity().set_online(true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(app.coordinator().outbox().is_empty().await.unwrap());
    assert_eq!(app.coordinator().stats().drains_succeeded, 1);

    background.shutdown().await;
    app.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_connection_skips_scheduled_sync() {
    let app = BudgetSync::open(AppConfig::default(), true).await.unwrap();
    app.connectivity()
        .update_quality(ConnectionQuality::from_rtt(Duration::from_millis(2500)));
    assert!(app.connectivity().is_slow_connection());

    let background = app.start_background(Arc::new(Inbox::default()), Arc::new(NoHostWakeup));
    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    assert_eq!(background.handle(tasks::DATA_SYNC).unwrap().iterations(), 2);
    assert_eq!(app.coordinator().stats().drains_succeeded, 0);

    background.shutdown().await;
    app.close().await.unwrap();
}
