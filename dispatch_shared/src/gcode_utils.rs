//! Shared G-code parsing utilities for the dispatcher

use crate::{Heater, Position};

/// Drop a trailing `;` comment and surrounding whitespace.
pub fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(idx) => line[..idx].trim(),
        None => line.trim(),
    }
}

fn word_value(token: &str, letter: char) -> Option<f64> {
    let rest = token.strip_prefix(letter)?;
    rest.parse().ok()
}

pub fn parse_gcode_line(line: &str, last_pos: &Position) -> Position {
    let mut pos = *last_pos;
    for token in strip_comment(line).split_whitespace() {
        if let Some(x) = word_value(token, 'X') {
            pos.x = x;
        } else if let Some(y) = word_value(token, 'Y') {
            pos.y = y;
        } else if let Some(z) = word_value(token, 'Z') {
            pos.z = z;
        } else if let Some(e) = word_value(token, 'E') {
            pos.e = e;
        }
    }
    pos
}

/// Recognize a heater target command (`M104`/`M109` for tools, `M140`/`M190`
/// for the platform). Tool commands default to tool 0 without a `T` word.
pub fn parse_temperature_command(line: &str) -> Option<(Heater, f64)> {
    let code = strip_comment(line);
    let mut tokens = code.split_whitespace();
    let command = tokens.next()?;
    let platform = match command {
        "M104" | "M109" => false,
        "M140" | "M190" => true,
        _ => return None,
    };
    let mut tool = 0u8;
    let mut target = None;
    for token in tokens {
        if let Some(t) = token.strip_prefix('T').and_then(|t| t.parse().ok()) {
            tool = t;
        } else if let Some(s) = word_value(token, 'S') {
            target = Some(s);
        }
    }
    let heater = if platform { Heater::Platform } else { Heater::Tool(tool) };
    target.map(|t| (heater, t))
}

/// Format a coordinate for G-code output without trailing zeros.
pub fn fmt_coord(value: f64) -> String {
    let text = format!("{:.4}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_updates_only_named_axes() {
        let start = Position::new(1.0, 2.0, 3.0, 4.0);
        let pos = parse_gcode_line("G1 X10 E5.5 ; perimeter", &start);
        assert_eq!(pos, Position::new(10.0, 2.0, 3.0, 5.5));
    }

    #[test]
    fn comment_words_are_ignored() {
        let start = Position::default();
        assert_eq!(parse_gcode_line("; X99 Y99", &start), start);
    }

    #[test]
    fn temperature_commands() {
        assert_eq!(parse_temperature_command("M104 S210"), Some((Heater::Tool(0), 210.0)));
        assert_eq!(parse_temperature_command("M109 T1 S220"), Some((Heater::Tool(1), 220.0)));
        assert_eq!(parse_temperature_command("M140 S60 ; bed"), Some((Heater::Platform, 60.0)));
        assert_eq!(parse_temperature_command("M190 S0"), Some((Heater::Platform, 0.0)));
        assert_eq!(parse_temperature_command("M104"), None);
        assert_eq!(parse_temperature_command("G1 X1 S3"), None);
    }

    #[test]
    fn coordinates_are_trimmed() {
        assert_eq!(fmt_coord(35.0), "35");
        assert_eq!(fmt_coord(1.25), "1.25");
        assert_eq!(fmt_coord(-0.00001), "0");
        assert_eq!(fmt_coord(-2.5), "-2.5");
    }
}
