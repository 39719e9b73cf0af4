//! Forwarding of worker stdout/stderr into host tracing.
//!
//! Worker lines look like `<date> <time> <LEVEL> <component> <message>`.
//! Matching lines are re-emitted at the mapped level under the
//! `workerlink::worker` target; anything else goes out at trace.

use tracing::Level;

pub const WORKER_LOG_TARGET: &str = "workerlink::worker";

/// One parsed worker log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLogLine<'a> {
    pub level: Level,
    pub component: &'a str,
    pub message: &'a str,
}

/// Split the first whitespace-delimited token off `s`.
///
/// Requires at least one whitespace character after the token.
fn take_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    let end = s.find(char::is_whitespace)?;
    if end == 0 {
        return None;
    }
    let (token, rest) = s.split_at(end);
    Some((token, rest))
}

fn parse_level(token: &str) -> Option<Level> {
    match token {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" => Some(Level::WARN),
        "ERROR" => Some(Level::ERROR),
        _ => None,
    }
}

pub fn parse_line(line: &str) -> Option<WorkerLogLine<'_>> {
    let (_date, rest) = take_token(line)?;
    let (_time, rest) = take_token(rest)?;
    let (level, rest) = take_token(rest)?;
    let level = parse_level(level)?;
    let (component, rest) = take_token(rest)?;
    Some(WorkerLogLine {
        level,
        component,
        message: rest.trim_start(),
    })
}

/// Re-emit one worker output line.
pub fn forward_line(stream: &'static str, line: &str) {
    let Some(parsed) = parse_line(line) else {
        tracing::trace!(target: WORKER_LOG_TARGET, stream, "{}", line);
        return;
    };
    let WorkerLogLine {
        level,
        component,
        message,
    } = parsed;
    match level {
        Level::ERROR => tracing::error!(target: WORKER_LOG_TARGET, stream, component, "{}", message),
        Level::WARN => tracing::warn!(target: WORKER_LOG_TARGET, stream, component, "{}", message),
        Level::INFO => tracing::info!(target: WORKER_LOG_TARGET, stream, component, "{}", message),
        Level::DEBUG => tracing::debug!(target: WORKER_LOG_TARGET, stream, component, "{}", message),
        _ => tracing::trace!(target: WORKER_LOG_TARGET, stream, component, "{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_line() {
        let line = "2024-05-01 12:00:01.123 INFO Controller Commissioning node 4";
        assert_eq!(
            parse_line(line),
            Some(WorkerLogLine {
                level: Level::INFO,
                component: "Controller",
                message: "Commissioning node 4",
            })
        );
    }

    #[test]
    fn every_level_maps() {
        for (token, level) in [
            ("TRACE", Level::TRACE),
            ("DEBUG", Level::DEBUG),
            ("INFO", Level::INFO),
            ("WARN", Level::WARN),
            ("ERROR", Level::ERROR),
        ] {
            let line = format!("d t {token} comp msg");
            assert_eq!(parse_line(&line).map(|l| l.level), Some(level));
        }
    }

    #[test]
    fn empty_message_after_component_is_allowed() {
        let parsed = parse_line("d t WARN comp ").unwrap();
        assert_eq!(parsed.component, "comp");
        assert_eq!(parsed.message, "");
    }

    #[test]
    fn unstructured_lines_do_not_parse() {
        assert_eq!(parse_line("Listening on port 5580"), None);
        assert_eq!(parse_line("d t NOTICE comp msg"), None);
        assert_eq!(parse_line("d t INFO comp"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn forward_line_accepts_anything() {
        forward_line("stdout", "2024-05-01 12:00:01 ERROR Server boom");
        forward_line("stderr", "plain text");
    }
}
