use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use shoppack_core::PollResponse;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    if std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
    json: bool,
}

pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    current: u64,
    state: String,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn new(style: OutputStyle, json: bool) -> Self {
        Self { style, json }
    }

    pub(crate) fn json(self) -> bool {
        self.json
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        if self.json {
            return;
        }
        println!("{}", render_status_line(self.style, status, message));
    }

    /// One line per poll. Rich terminals show the bar instead.
    pub(crate) fn print_response(self, label: &str, txid: &str, response: &PollResponse) {
        if self.json {
            match serde_json::to_string(response) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!(error = %err, "failed to encode poll response"),
            }
            return;
        }
        if self.style == OutputStyle::Plain {
            println!("{}", render_response_line(label, txid, response));
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_progress(self, label: &str) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich && !self.json {
            let progress_bar = ProgressBar::new(100);
            match ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<22} [{bar:20.cyan/blue}] {pos:>3}% {elapsed}",
            ) {
                Ok(style) => progress_bar.set_style(
                    style.tick_chars(tick_chars(label)).progress_chars("=>-"),
                ),
                Err(err) => tracing::debug!(error = %err, "progress template rejected"),
            }
            progress_bar.set_message(format!("{label} started"));
            progress_bar.enable_steady_tick(Duration::from_millis(100));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            current: 0,
            state: "started".to_string(),
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl TerminalProgress {
    pub(crate) fn set(&mut self, response: &PollResponse) {
        self.current = u64::from(response.progress).min(100);
        self.state.clone_from(&response.state);

        let Some(progress_bar) = &self.progress_bar else {
            return;
        };
        progress_bar.set_position(self.current);
        progress_bar.set_message(format!("{} {}", self.label, self.state));
    }

    pub(crate) fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            self.current,
            &self.state,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "error" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn render_response_line(label: &str, txid: &str, response: &PollResponse) -> String {
    let mut line = format!(
        "{label} {txid}: {} ({}%)",
        response.state, response.progress
    );
    if response.clear_cache {
        line.push_str(" clear-cache");
    }
    line
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.3}s", elapsed.as_secs_f64())
}

fn tick_chars(label: &str) -> &'static str {
    match label {
        "install" => ".oO@* ",
        "remove" => "\\|/- ",
        _ => "|/-\\ ",
    }
}

fn label_style(label: &str) -> Style {
    let color = if label == "remove" {
        AnsiColor::BrightYellow
    } else {
        AnsiColor::BrightCyan
    };
    Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
}

fn paint(style: Style, text: &str) -> String {
    format!("{style}{text}{style:#}")
}

pub(crate) fn render_progress_line(
    style: OutputStyle,
    label: &str,
    percent: u64,
    state: &str,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    const BAR_WIDTH: usize = 20;
    let percent = percent.min(100);
    let filled = percent as usize * BAR_WIDTH / 100;
    let mut bar = "=".repeat(filled);
    bar.push_str(&"-".repeat(BAR_WIDTH - filled));

    let mut line = format!(
        "{} [{}] {percent:>3}% {state}",
        paint(label_style(label), label),
        paint(Style::new().fg_color(Some(AnsiColor::BrightBlue.into())), &bar),
    );
    if let Some(elapsed) = elapsed {
        line.push_str(" in ");
        line.push_str(&format_elapsed(elapsed));
    }
    Some(line)
}
