use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use console::{style, Key, Term};
use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};

use super::transfer::Interaction;
use crate::utils::progress::{ProgressSnapshot, ProgressTracker};

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:.bold} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";
const BAR_CHARS: &str = "█▓▒░";
const REFRESH: Duration = Duration::from_millis(100);
const MAX_LISTED_CONFLICTS: usize = 5;

/// Terminal-backed answers to the orchestrator's questions
///
/// A monitor attached with [`ConsoleInteraction::with_monitor`] is only
/// started once the orchestrator reports that streaming begins, so prompts
/// never share the terminal with the bar or the key listener.
pub struct ConsoleInteraction {
    term: Term,
    assume_yes: bool,
    pending: Option<(Arc<ProgressTracker>, String, bool)>,
    monitor: Option<TransferMonitor>,
}

impl ConsoleInteraction {
    pub fn new(assume_yes: bool) -> Self {
        Self {
            term: Term::stderr(),
            assume_yes,
            pending: None,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, tracker: Arc<ProgressTracker>, label: &str, key_controls: bool) -> Self {
        self.pending = Some((tracker, label.to_string(), key_controls));
        self
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_some()
    }

    /// Stop the bar and key listener if they are running
    pub fn finish_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.finish();
        }
    }

    fn ask(&self, question: &str, default: bool) -> bool {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        if self.term.write_str(&format!("{} {} ", question, style(hint).dim())).is_err() {
            return default;
        }
        match self.term.read_line() {
            Ok(answer) => match answer.trim().to_ascii_lowercase().as_str() {
                "" => default,
                "y" | "yes" => true,
                _ => false,
            },
            Err(_) => default,
        }
    }
}

impl Interaction for ConsoleInteraction {
    fn prompt_password(&mut self, archive: &Path, attempt: u32) -> Option<String> {
        let header = if attempt == 1 {
            format!("{} {}", style("Password required for").yellow(), style(archive.display()).bold())
        } else {
            format!("{} (attempt {})", style("Enter the password again").yellow(), attempt)
        };
        self.term.write_line(&header).ok()?;
        self.term.write_str("Password (empty to give up): ").ok()?;
        self.term.read_secure_line().ok()
    }

    fn confirm_retry(&mut self) -> bool {
        let _ = self.term.write_line(&style("Wrong password.").red().to_string());
        self.ask("Try another password?", true)
    }

    fn confirm_overwrite(&mut self, conflicts: &[PathBuf]) -> bool {
        if self.assume_yes {
            return true;
        }
        let _ = self.term.write_line(&format!(
            "{} {} existing file(s) would be replaced:",
            style("!").yellow().bold(),
            conflicts.len()
        ));
        for path in conflicts.iter().take(MAX_LISTED_CONFLICTS) {
            let _ = self.term.write_line(&format!("  {}", style(path.display()).dim()));
        }
        if conflicts.len() > MAX_LISTED_CONFLICTS {
            let _ = self
                .term
                .write_line(&format!("  ... and {} more", conflicts.len() - MAX_LISTED_CONFLICTS));
        }
        self.ask("Overwrite?", false)
    }

    fn transfer_starting(&mut self) {
        if let Some((tracker, label, key_controls)) = self.pending.take() {
            self.monitor = Some(TransferMonitor::start(tracker, &label, key_controls));
        }
    }

    fn notify_password_used(&mut self, _password: &str) {
        self.finish_monitor();
        let _ = self
            .term
            .write_line(&style("Password remembered for next time.").dim().to_string());
    }
}

/// Progress bar and optional key controls for one transfer
///
/// The bar thread renders [`ProgressTracker::snapshot`] until
/// [`TransferMonitor::finish`]. With key controls, `p` or space toggles
/// pause and `q` or Esc cancels.
pub struct TransferMonitor {
    done: Arc<AtomicBool>,
    bar: Option<JoinHandle<()>>,
    keys: Option<JoinHandle<()>>,
}

impl TransferMonitor {
    pub fn start(tracker: Arc<ProgressTracker>, label: &str, key_controls: bool) -> Self {
        let done = Arc::new(AtomicBool::new(false));

        let bar = {
            let done = Arc::clone(&done);
            let tracker = Arc::clone(&tracker);
            let label = label.to_string();
            thread::spawn(move || render_loop(&tracker, &label, &done))
        };

        let keys = if key_controls && Term::stderr().is_term() {
            let done = Arc::clone(&done);
            Some(thread::spawn(move || key_loop(&tracker, &done)))
        } else {
            None
        };

        Self {
            done,
            bar: Some(bar),
            keys,
        }
    }

    /// Stop rendering; waits for the key listener to see one more key
    pub fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(bar) = self.bar.take() {
            let _ = bar.join();
        }
        if let Some(keys) = self.keys.take() {
            if !keys.is_finished() {
                let _ = Term::stderr().write_line(&style("Press any key to continue.").dim().to_string());
            }
            let _ = keys.join();
        }
    }
}

impl Drop for TransferMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bar_style() -> ProgressStyle {
    match ProgressStyle::with_template(BAR_TEMPLATE) {
        Ok(style) => style.progress_chars(BAR_CHARS),
        Err(_) => ProgressStyle::default_bar(),
    }
}

fn render_loop(tracker: &ProgressTracker, label: &str, done: &AtomicBool) {
    let pb = ProgressBar::new(0).with_style(bar_style());
    pb.set_prefix(label.to_string());

    loop {
        let snapshot = tracker.snapshot();
        pb.set_length(snapshot.total);
        pb.set_position(snapshot.completed);
        pb.set_message(status_message(&snapshot));
        pb.tick();

        if done.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(REFRESH);
    }
    pb.finish_and_clear();
}

fn key_loop(tracker: &ProgressTracker, done: &AtomicBool) {
    let term = Term::stderr();
    while !done.load(Ordering::SeqCst) {
        match term.read_key() {
            Ok(Key::Char('p')) | Ok(Key::Char(' ')) => {
                let paused = tracker.toggle_pause();
                tracing::debug!(paused, "pause toggled");
            }
            Ok(Key::Char('q')) | Ok(Key::Escape) => {
                tracker.cancel();
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

/// Speed, remaining time and pause state for the bar message
pub fn status_message(snapshot: &ProgressSnapshot) -> String {
    if snapshot.cancelled {
        return "cancelling".to_string();
    }
    if snapshot.paused {
        return "paused".to_string();
    }
    let speed = format!("{}/s", HumanBytes(snapshot.speed as u64));
    match snapshot.remaining {
        Some(remaining) => format!("{} ({} left)", speed, HumanDuration(remaining)),
        None => speed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(speed: f64, remaining: Option<Duration>) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: 10,
            total: 100,
            speed,
            ceiling: speed,
            remaining,
            paused: false,
            cancelled: false,
        }
    }

    #[test]
    fn test_status_message() {
        assert_eq!(status_message(&snapshot(2048.0, None)), "2.00 KiB/s");
        let message = status_message(&snapshot(2048.0, Some(Duration::from_secs(30))));
        assert!(message.starts_with("2.00 KiB/s ("));
        assert!(message.ends_with("left)"));

        let mut paused = snapshot(0.0, None);
        paused.paused = true;
        assert_eq!(status_message(&paused), "paused");
    }

    #[test]
    fn test_monitor_waits_for_transfer_start() {
        let tracker = Arc::new(ProgressTracker::new());
        let mut interaction = ConsoleInteraction::new(true).with_monitor(Arc::clone(&tracker), "test", false);
        assert!(!interaction.is_monitoring());
        assert!(interaction.confirm_overwrite(&[PathBuf::from("x")]));
        assert!(!interaction.is_monitoring());

        interaction.transfer_starting();
        assert!(interaction.is_monitoring());
        interaction.finish_monitor();
        assert!(!interaction.is_monitoring());

        interaction.transfer_starting();
        assert!(!interaction.is_monitoring());
    }

    #[test]
    fn test_monitor_stops() {
        let tracker = Arc::new(ProgressTracker::new());
        let monitor = TransferMonitor::start(Arc::clone(&tracker), "test", false);
        tracker.on_progress(5, 10);
        monitor.finish();
    }
}
