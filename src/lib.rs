pub mod application;
pub mod domain;
pub mod infrastructure;

use application::coordinator::{CoordinatorSnapshot, StateNotification};
use application::history_cache::HistorySyncOutcome;
use application::service::RemoteService;
use domain::models::TimerState;
use infrastructure::config::workspace_root_from_lookup;
use infrastructure::error::InfraError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::warn;

const HISTORY_DAYS_SHOWN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleCommand {
    Toggle,
    Skip,
    Reset,
    Reconnect,
    Status,
    History,
    Goal(u32),
    Quit,
}

/// `Ok(None)` for blank input.
fn parse_console_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "toggle" | "t" => ConsoleCommand::Toggle,
        "skip" | "s" => ConsoleCommand::Skip,
        "reset" | "r" => ConsoleCommand::Reset,
        "reconnect" => ConsoleCommand::Reconnect,
        "status" => ConsoleCommand::Status,
        "history" => ConsoleCommand::History,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        "goal" => {
            let raw = words.next().ok_or_else(|| "usage: goal <n>".to_string())?;
            match raw.parse::<u32>() {
                Ok(goal) if goal > 0 => ConsoleCommand::Goal(goal),
                _ => return Err(format!("invalid goal '{raw}'")),
            }
        }
        other => return Err(format!("unknown command '{other}'")),
    };

    if words.next().is_some() {
        return Err(format!("unexpected arguments after '{verb}'"));
    }
    Ok(Some(command))
}

fn format_clock(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.ceil() as u64
    } else {
        0
    };
    format!("{:02}:{:02}", total / 60, total % 60)
}

fn describe_state(state: &TimerState) -> String {
    let next = state
        .next_phase
        .map(|phase| format!(" next {phase}"))
        .unwrap_or_default();
    format!(
        "{} {} {} ({}/{}){}",
        state.phase,
        state.status.as_str(),
        format_clock(state.remaining),
        state.completed,
        state.goal,
        next
    )
}

fn describe_snapshot(snapshot: &CoordinatorSnapshot) -> String {
    let mut line = format!("{} [{}]", describe_state(&snapshot.state), snapshot.phase);
    if snapshot.offline_since > 0 {
        line.push_str(&format!(" offline since {}", snapshot.offline_since));
    }
    line
}

fn describe_notification(notification: &StateNotification) -> String {
    match notification {
        StateNotification::Updated { state, connected } => {
            let link = if *connected { "online" } else { "offline" };
            format!("{} [{link}]", describe_state(state))
        }
        StateNotification::Completed { state, session } => format!(
            "finished {} ({} min); now {}",
            session.phase,
            session.duration / 60,
            describe_state(state)
        ),
    }
}

async fn print_notifications(mut notifications: broadcast::Receiver<StateNotification>) {
    loop {
        match notifications.recv().await {
            Ok(notification) => println!("{}", describe_notification(&notification)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "console fell behind state notifications");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_history(service: &RemoteService) {
    match service.refresh_history(false).await {
        Some(HistorySyncOutcome::Success { days_updated }) => println!("history synced ({days_updated} days)"),
        Some(HistorySyncOutcome::NetworkError(message)) => println!("server unreachable, showing cache: {message}"),
        Some(HistorySyncOutcome::Error(message)) => println!("history sync failed, showing cache: {message}"),
        None => {}
    }

    let history = service.history();
    match history.day_stats() {
        Ok(days) if days.is_empty() => println!("no history cached"),
        Ok(days) => {
            for day in days.iter().take(HISTORY_DAYS_SHOWN) {
                println!(
                    "{}  {:>2} sessions  {:>4} min work  {:>3} min break",
                    day.date, day.completed, day.work_minutes, day.break_minutes
                );
            }
        }
        Err(error) => println!("history unavailable: {error}"),
    }
    if let (Ok(sessions), Ok(minutes), Ok(active)) = (
        history.total_sessions(),
        history.total_work_minutes(),
        history.days_with_activity(),
    ) {
        println!("total: {sessions} sessions, {minutes} min over {active} active days");
    }
}

async fn execute(service: &RemoteService, command: ConsoleCommand) {
    let coordinator = service.coordinator();
    match command {
        ConsoleCommand::Toggle => {
            coordinator.toggle();
        }
        ConsoleCommand::Skip => {
            coordinator.skip();
        }
        ConsoleCommand::Reset => {
            coordinator.reset();
        }
        ConsoleCommand::Reconnect => {
            coordinator.reconnect();
        }
        ConsoleCommand::Status => match coordinator.snapshot().await {
            Some(snapshot) => println!("{}", describe_snapshot(&snapshot)),
            None => println!("coordinator stopped"),
        },
        ConsoleCommand::History => print_history(service).await,
        ConsoleCommand::Goal(goal) => match coordinator.snapshot().await {
            Some(snapshot) => {
                let mut settings = snapshot.settings;
                settings.daily_goal = goal;
                coordinator.update_settings(settings);
            }
            None => println!("coordinator stopped"),
        },
        ConsoleCommand::Quit => {}
    }
}

async fn console_loop(service: &RemoteService) -> Result<(), InfraError> {
    let printer = tokio::spawn(print_notifications(service.coordinator().subscribe()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        match parse_console_command(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(command)) => execute(service, command).await,
            Err(message) => println!("{message}"),
        }
    }

    printer.abort();
    Ok(())
}

pub fn run() {
    let fallback = std::env::current_dir().expect("failed to resolve current directory");
    let workspace_root = workspace_root_from_lookup(|key| std::env::var(key).ok(), &fallback);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    runtime.block_on(async move {
        let service = RemoteService::start(&workspace_root).expect("failed to start pomoremote");
        if let Err(error) = console_loop(&service).await {
            warn!(%error, "console input failed");
        }
        service.shutdown().await;
    });
}
