//! Tagged status lines for command output

use super::context::UiContext;
use console::style;

/// Severity of a status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Ok,
    Warn,
    Info,
}

impl Level {
    fn tag(self) -> String {
        match self {
            Self::Ok => style("[OK]").green().to_string(),
            Self::Warn => style("[WARN]").yellow().to_string(),
            Self::Info => style("[INFO]").cyan().to_string(),
        }
    }
}

/// Trailing part of a line
#[derive(Debug, Clone, Copy)]
enum Detail<'a> {
    None,
    /// `message (detail)`
    Note(&'a str),
    /// `message - hint`
    Hint(&'a str),
}

fn plain_line(level: Level, message: &str, detail: Detail<'_>) -> String {
    match detail {
        Detail::None => format!("  {} {}", level.tag(), message),
        Detail::Note(note) => format!("  {} {} ({})", level.tag(), message, note),
        Detail::Hint(hint) => format!("  {} {} - {}", level.tag(), message, hint),
    }
}

fn emit(ctx: &UiContext, level: Level, message: &str, detail: Detail<'_>) {
    if !ctx.use_fancy_output() {
        println!("{}", plain_line(level, message, detail));
        return;
    }

    let text = match detail {
        Detail::None => message.to_string(),
        Detail::Note(note) => format!("{} ({})", message, style(note).dim()),
        Detail::Hint(hint) => format!("{} - {}", message, style(hint).dim()),
    };
    // Output errors on a closed terminal are ignored
    let _ = match level {
        Level::Ok => cliclack::log::success(text),
        Level::Warn => cliclack::log::warning(text),
        Level::Info => cliclack::log::info(text),
    };
}

pub fn step_ok(ctx: &UiContext, message: &str) {
    emit(ctx, Level::Ok, message, Detail::None);
}

/// Success line with a parenthesized detail
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    emit(ctx, Level::Ok, message, Detail::Note(detail));
}

pub fn step_warn(ctx: &UiContext, message: &str) {
    emit(ctx, Level::Warn, message, Detail::None);
}

/// Warning line followed by what to do about it
pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    emit(ctx, Level::Warn, message, Detail::Hint(hint));
}

pub fn step_info(ctx: &UiContext, message: &str) {
    emit(ctx, Level::Info, message, Detail::None);
}
