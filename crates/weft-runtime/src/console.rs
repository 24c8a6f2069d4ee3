//! Console interception for scripts.
//!
//! While an execution is in progress every `console.*` call lands in that
//! execution's capture buffer. Outside of an execution (module top level,
//! stray timers) the message goes to `tracing` at debug level.

use weft_core::{ConsoleMessage, Level};

#[derive(Debug, Default)]
pub(crate) struct ConsoleCapture {
    active: Option<Vec<ConsoleMessage>>,
}

impl ConsoleCapture {
    pub(crate) fn begin(&mut self) {
        self.active = Some(Vec::new());
    }

    /// Stop capturing and return what was recorded since `begin`.
    pub(crate) fn finish(&mut self) -> Vec<ConsoleMessage> {
        self.active.take().unwrap_or_default()
    }

    pub(crate) fn record(&mut self, message: ConsoleMessage) {
        match &mut self.active {
            Some(buffer) => buffer.push(message),
            None => {
                tracing::debug!(target: "weft::script", level = %message.level, "{}", message.text)
            }
        }
    }
}

/// Level for the numeric code the prelude passes to the host.
pub(crate) fn level_from_code(code: i32) -> Level {
    match code {
        0 => Level::Debug,
        2 => Level::Warning,
        3 => Level::Error,
        _ => Level::Info,
    }
}

/// One console call becomes one message; each argument is a line.
pub(crate) fn message_from_args(code: i32, args: Vec<String>) -> ConsoleMessage {
    ConsoleMessage::new(level_from_code(code), args.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_only_between_begin_and_finish() {
        let mut capture = ConsoleCapture::default();
        capture.record(ConsoleMessage::new(Level::Info, "before"));
        capture.begin();
        capture.record(message_from_args(2, vec!["careful".into(), "twice".into()]));
        let messages = capture.finish();
        capture.record(ConsoleMessage::new(Level::Info, "after"));

        assert_eq!(messages, vec![ConsoleMessage::new(Level::Warning, "careful\ntwice")]);
        assert!(capture.finish().is_empty());
    }

    #[test]
    fn unknown_codes_are_info() {
        assert_eq!(level_from_code(1), Level::Info);
        assert_eq!(level_from_code(42), Level::Info);
        assert_eq!(level_from_code(3), Level::Error);
    }
}
