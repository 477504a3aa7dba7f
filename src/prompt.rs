//! Operator confirmation after an apply
//!
//! On a terminal the operator gets a one-line countdown and a single
//! keypress decides. Without a terminal (piped stdin) a line of input is read
//! instead. Either way SIGINT rolls back, and so does silence: the countdown
//! running out is [`ConfirmOutcome::TimedOut`].

use crate::core::transaction::{Confirmation, ConfirmOutcome};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::io::Write;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Confirmation prompt on the controlling terminal
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Confirmation for TerminalPrompt {
    async fn wait(&mut self, timeout: Duration) -> ConfirmOutcome {
        if stdin_is_tty() {
            countdown(timeout).await
        } else {
            read_answer(timeout).await
        }
    }
}

fn stdin_is_tty() -> bool {
    use std::os::fd::AsFd;
    nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false)
}

/// What a keypress during the countdown means, if anything
pub fn classify_key(key: KeyEvent) -> Option<ConfirmOutcome> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char('c' | 'C' | 'd' | 'D'))
    {
        return Some(ConfirmOutcome::Aborted);
    }
    match key.code {
        KeyCode::Enter | KeyCode::Char('y' | 'Y' | 'c' | 'C') => Some(ConfirmOutcome::Confirmed),
        KeyCode::Esc | KeyCode::Char('n' | 'N' | 'r' | 'R') => Some(ConfirmOutcome::Aborted),
        _ => None,
    }
}

/// What a line of piped input means, if anything
pub fn parse_answer(line: &str) -> Option<ConfirmOutcome> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "confirm" => Some(ConfirmOutcome::Confirmed),
        "n" | "no" | "rollback" => Some(ConfirmOutcome::Aborted),
        _ => None,
    }
}

/// Whole seconds left, rounded up so the display never shows 0 early
fn seconds_left(remaining: Duration) -> u64 {
    remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
}

async fn countdown(timeout: Duration) -> ConfirmOutcome {
    let cancel = CancellationToken::new();
    let reader_cancel = cancel.clone();
    let mut reader = tokio::task::spawn_blocking(move || read_keys(timeout, &reader_cancel));

    tokio::select! {
        result = &mut reader => {
            return result.unwrap_or_else(|e| {
                warn!("key reader failed: {e}");
                ConfirmOutcome::Aborted
            });
        }
        _ = tokio::signal::ctrl_c() => {
            debug!("interrupted during countdown");
        }
    }

    cancel.cancel();
    // The reader restores the terminal before it returns
    let _ = reader.await;
    ConfirmOutcome::Aborted
}

/// Raw-mode key loop; runs on a blocking thread
fn read_keys(timeout: Duration, cancel: &CancellationToken) -> ConfirmOutcome {
    if let Err(e) = crossterm::terminal::enable_raw_mode() {
        warn!("Failed to enable raw mode: {e}");
        return ConfirmOutcome::Aborted;
    }

    let outcome = poll_keys(Instant::now() + timeout, cancel);

    // Always restore terminal to normal mode
    let _ = crossterm::terminal::disable_raw_mode();
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "\r\x1b[K");
    let _ = stderr.flush();

    outcome
}

fn poll_keys(deadline: Instant, cancel: &CancellationToken) -> ConfirmOutcome {
    let mut stderr = std::io::stderr();
    let mut shown = None;

    loop {
        if cancel.is_cancelled() {
            return ConfirmOutcome::Aborted;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ConfirmOutcome::TimedOut;
        }

        let secs = seconds_left(remaining);
        if shown != Some(secs) {
            let _ = write!(
                stderr,
                "\rRollback in {secs:3}s  [Enter/y=keep, n/r/Esc=roll back now]   "
            );
            let _ = stderr.flush();
            shown = Some(secs);
        }

        match event::poll(remaining.min(POLL_INTERVAL)) {
            Ok(true) => {
                if let Ok(Event::Key(key)) = event::read()
                    && let Some(outcome) = classify_key(key)
                {
                    return outcome;
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to read terminal events: {e}");
                return ConfirmOutcome::Aborted;
            }
        }
    }
}

async fn read_answer(timeout: Duration) -> ConfirmOutcome {
    use tokio::io::AsyncBufReadExt;

    eprintln!(
        "Type 'yes' within {}s to keep the changes, 'no' to roll back now.",
        timeout.as_secs()
    );
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    let answer = async {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(outcome) = parse_answer(&line) {
                        return outcome;
                    }
                }
                // Nobody left to confirm
                Ok(None) | Err(_) => return ConfirmOutcome::Aborted,
            }
        }
    };

    tokio::select! {
        outcome = answer => outcome,
        () = tokio::time::sleep(timeout) => ConfirmOutcome::TimedOut,
        _ = tokio::signal::ctrl_c() => ConfirmOutcome::Aborted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn test_classify_key() {
        assert_eq!(
            classify_key(press(KeyCode::Enter, KeyModifiers::NONE)),
            Some(ConfirmOutcome::Confirmed)
        );
        assert_eq!(
            classify_key(press(KeyCode::Char('y'), KeyModifiers::NONE)),
            Some(ConfirmOutcome::Confirmed)
        );
        assert_eq!(
            classify_key(press(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(ConfirmOutcome::Aborted)
        );
        assert_eq!(
            classify_key(press(KeyCode::Esc, KeyModifiers::NONE)),
            Some(ConfirmOutcome::Aborted)
        );
        assert_eq!(classify_key(press(KeyCode::Char('x'), KeyModifiers::NONE)), None);
    }

    #[test]
    fn test_key_release_ignored() {
        let mut key = press(KeyCode::Enter, KeyModifiers::NONE);
        key.kind = KeyEventKind::Release;
        assert_eq!(classify_key(key), None);
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer(" YES \n"), Some(ConfirmOutcome::Confirmed));
        assert_eq!(parse_answer("no"), Some(ConfirmOutcome::Aborted));
        assert_eq!(parse_answer("maybe"), None);
        assert_eq!(parse_answer(""), None);
    }

    #[test]
    fn test_seconds_left_rounds_up() {
        assert_eq!(seconds_left(Duration::from_millis(29_001)), 30);
        assert_eq!(seconds_left(Duration::from_secs(30)), 30);
        assert_eq!(seconds_left(Duration::from_millis(1)), 1);
    }

    #[test]
    fn test_cancelled_reader_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            poll_keys(Instant::now() + Duration::from_secs(30), &cancel),
            ConfirmOutcome::Aborted
        );
    }

    #[test]
    fn test_elapsed_deadline_times_out() {
        let cancel = CancellationToken::new();
        assert_eq!(poll_keys(Instant::now(), &cancel), ConfirmOutcome::TimedOut);
    }
}
