//! Terminal styling for log lines and the pixel progress bar.
//!
//! Styling is plain when `--no-color` is given, when `NO_COLOR` or
//! `SEGCAM_NO_COLOR` is non-empty, when `TERM=dumb`, or when stderr is not a TTY.

use colored::{Color, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use log::Level;
use std::io::{stderr, IsTerminal};
use std::sync::OnceLock;
use std::time::Duration;

static STYLING: OnceLock<Styling> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Styling {
    Plain,
    Ansi,
}

impl Styling {
    fn detect(no_color_flag: bool) -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self::from_env(
            no_color_flag,
            var("NO_COLOR").as_deref(),
            var("SEGCAM_NO_COLOR").as_deref(),
            var("TERM").as_deref(),
            stderr().is_terminal(),
        )
    }

    fn from_env(
        no_color_flag: bool,
        no_color: Option<&str>,
        segcam_no_color: Option<&str>,
        term: Option<&str>,
        stderr_is_tty: bool,
    ) -> Self {
        let set = |value: Option<&str>| value.is_some_and(|v| !v.is_empty());
        if no_color_flag
            || set(no_color)
            || set(segcam_no_color)
            || term == Some("dumb")
            || !stderr_is_tty
        {
            Styling::Plain
        } else {
            Styling::Ansi
        }
    }

    fn current() -> Self {
        STYLING
            .get()
            .copied()
            .unwrap_or_else(|| Styling::detect(false))
    }
}

/// Fix the styling for the rest of the process. Later calls are ignored.
pub fn init_color_config(no_color_flag: bool) {
    let _ = STYLING.set(Styling::detect(no_color_flag));
}

fn paint(text: &str, color: Color, bold: bool) -> String {
    match Styling::current() {
        Styling::Plain => text.to_string(),
        Styling::Ansi if bold => text.color(color).bold().to_string(),
        Styling::Ansi => text.color(color).to_string(),
    }
}

/// `ERROR`, `WARN`, ... tag for the log formatter
pub fn level_tag(level: Level) -> String {
    match level {
        Level::Error => paint("ERROR", Color::Red, true),
        Level::Warn => paint("WARN", Color::Yellow, false),
        Level::Info => paint("INFO", Color::Green, false),
        Level::Debug => paint("DEBUG", Color::Blue, false),
        Level::Trace => paint("TRACE", Color::Magenta, false),
    }
}

/// Leading marker for a log message.
#[derive(Debug, Clone, Copy)]
pub enum Marker {
    Start,
    Failed,
    Done,
    Warning,
}

impl Marker {
    pub fn prefix(self) -> &'static str {
        match (self, Styling::current()) {
            (Marker::Start, Styling::Ansi) => "🔍 ",
            (Marker::Failed, Styling::Ansi) => "❌ ",
            (Marker::Done, Styling::Ansi) => "✅ ",
            (Marker::Warning, Styling::Ansi) => "⚠️  ",
            (Marker::Failed, Styling::Plain) => "[FAILED] ",
            (Marker::Done, Styling::Plain) => "[SUCCESS] ",
            (Marker::Start | Marker::Warning, Styling::Plain) => "",
        }
    }
}

/// Bar over the query pixels of one image; `None` for a single pixel or a non-interactive stderr.
pub fn pixel_progress_bar(total: usize) -> Option<ProgressBar> {
    if total <= 1 || !stderr().is_terminal() {
        return None;
    }
    let (template, chars) = match Styling::current() {
        Styling::Ansi => (
            "[{elapsed_precise}] [{bar:30.green/black}] {pos}/{len} pixels {msg}",
            "█▓▒░",
        ),
        Styling::Plain => ("[{elapsed_precise}] [{bar:30}] {pos}/{len} pixels {msg}", "#> "),
    };
    let style = ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(chars);

    let bar = ProgressBar::new(total as u64);
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(100));
    Some(bar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interactive_terminal_is_styled() {
        let styling = Styling::from_env(false, None, None, Some("xterm-256color"), true);
        assert_eq!(styling, Styling::Ansi);
        // an empty NO_COLOR does not count
        assert_eq!(Styling::from_env(false, Some(""), None, None, true), Styling::Ansi);
    }

    #[test]
    fn test_plain_when_disabled() {
        assert_eq!(Styling::from_env(true, None, None, None, true), Styling::Plain);
        assert_eq!(Styling::from_env(false, Some("1"), None, None, true), Styling::Plain);
        assert_eq!(Styling::from_env(false, None, Some("1"), None, true), Styling::Plain);
        assert_eq!(Styling::from_env(false, None, None, Some("dumb"), true), Styling::Plain);
        assert_eq!(Styling::from_env(false, None, None, None, false), Styling::Plain);
    }

    #[test]
    fn test_plain_tags_and_markers() {
        init_color_config(true);
        assert_eq!(level_tag(Level::Error), "ERROR");
        assert_eq!(Marker::Failed.prefix(), "[FAILED] ");
        assert_eq!(Marker::Warning.prefix(), "");
    }

    #[test]
    fn test_single_pixel_has_no_bar() {
        assert!(pixel_progress_bar(1).is_none());
    }
}
