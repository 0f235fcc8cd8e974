use std::io::{self, IsTerminal};

use anstyle::{AnsiColor, Effects, Style};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

/// Status lines go to stderr, so that is the stream that decides.
pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(io::stderr().is_terminal())
}

pub(crate) fn resolve_output_style(is_terminal: bool) -> OutputStyle {
    if is_terminal {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let badge = format!("[{}]", status.to_ascii_uppercase());
            format!("{} {message}", colorize(status_style(status), &badge))
        }
    }
}

fn status_style(status: &str) -> Style {
    let color = match status {
        "ok" => AnsiColor::BrightGreen,
        "warn" => AnsiColor::BrightYellow,
        "error" => AnsiColor::BrightRed,
        _ => AnsiColor::BrightBlue,
    };
    Style::new()
        .fg_color(Some(color.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
