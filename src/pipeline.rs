//! Outgoing command queue and echo/result correlation.
//!
//! TTP has no request identifiers. The device echoes every command line
//! verbatim and then prints one result line, so a response is matched to its
//! command purely by order. That only works with a single command in flight:
//! a new line is released to the writer only once the previous one has been
//! echoed and answered.
//!
//! ```text
//! outgoing ──poll──▶ awaiting_echo ──echo──▶ awaiting_result ──result──▶ Message
//! ```

use crate::message::{classify, LineKind, Message};
use crate::protocol::ParsedCommand;
use std::collections::VecDeque;

/// Poll cycles a command may stay in flight before the queues are cleared
pub const DEFAULT_STALL_THRESHOLD: u32 = 100;

#[derive(Debug)]
pub struct Pipeline {
    outgoing: VecDeque<String>,
    awaiting_echo: VecDeque<String>,
    awaiting_result: VecDeque<String>,
    stall_count: u32,
    stall_threshold: u32,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(DEFAULT_STALL_THRESHOLD)
    }
}

impl Pipeline {
    pub fn new(stall_threshold: u32) -> Self {
        Self {
            outgoing: VecDeque::new(),
            awaiting_echo: VecDeque::new(),
            awaiting_result: VecDeque::new(),
            stall_count: 0,
            stall_threshold,
        }
    }

    /// Queue a line for sending
    pub fn enqueue(&mut self, line: impl Into<String>) {
        self.outgoing.push_back(line.into());
    }

    /// One writer cycle
    ///
    /// Returns the next line to write when nothing is in flight. While a
    /// command is in flight this counts a stall cycle instead, and past the
    /// threshold the correlation queues are dropped so the queue can move on.
    pub fn poll(&mut self) -> Option<String> {
        if self.awaiting_echo.is_empty() && self.awaiting_result.is_empty() {
            let line = self.outgoing.pop_front()?;
            self.stall_count = 0;
            self.awaiting_echo.push_back(line.clone());
            return Some(line);
        }

        self.stall_count += 1;
        if self.stall_count > self.stall_threshold {
            tracing::warn!(
                "Timed out waiting for response, awaiting result = {}, awaiting echo = {}. Clearing queues!",
                self.awaiting_result.len(),
                self.awaiting_echo.len()
            );
            self.clear_in_flight();
        }
        None
    }

    /// Feed one received line
    ///
    /// Echoes advance the in-flight command, results and notifications come
    /// back as messages, anything else is discarded.
    pub fn on_line(&mut self, line: &str) -> Option<Message> {
        let message = match classify(line) {
            LineKind::Ok => self.take_result(line).map(|command| Message::Acknowledged { command }),
            LineKind::OkWithPayload(payload) => self
                .take_result(line)
                .map(|command| Message::AcknowledgedWithPayload { command, payload }),
            LineKind::Error(message) => match self.awaiting_result.pop_front() {
                Some(request) => Some(Message::ErrorResponse {
                    command: ParsedCommand::parse(&request),
                    message,
                }),
                None => {
                    tracing::error!("Error received with no request awaiting a result: {}", line);
                    self.clear_in_flight();
                    None
                }
            },
            LineKind::Notification {
                publish_token,
                payload,
            } => Some(Message::Notification {
                publish_token,
                payload,
            }),
            LineKind::Other => {
                if self.awaiting_echo.front().map(String::as_str) == Some(line) {
                    if let Some(sent) = self.awaiting_echo.pop_front() {
                        tracing::debug!("Now awaiting response for command: {}", sent);
                        self.awaiting_result.push_back(sent);
                    }
                } else {
                    tracing::debug!("Discarding unmatched line: {}", line);
                }
                None
            }
        };

        if message.is_some() {
            self.stall_count = 0;
        }
        message
    }

    fn take_result(&mut self, line: &str) -> Option<ParsedCommand> {
        match self.awaiting_result.pop_front() {
            Some(request) => {
                tracing::debug!("Response received for {}", request);
                Some(ParsedCommand::parse(&request))
            }
            None => {
                tracing::warn!("Result with no request awaiting it: {}", line);
                None
            }
        }
    }

    /// Drop the in-flight command, keep queued lines
    pub fn clear_in_flight(&mut self) {
        self.awaiting_echo.clear();
        self.awaiting_result.clear();
        self.stall_count = 0;
    }

    /// Drop everything, used when a new session starts
    pub fn reset(&mut self) {
        self.outgoing.clear();
        self.clear_in_flight();
    }

    /// True when nothing is queued or in flight
    pub fn is_idle(&self) -> bool {
        self.outgoing.is_empty() && !self.in_flight()
    }

    /// True while a command awaits its echo or result
    pub fn in_flight(&self) -> bool {
        !self.awaiting_echo.is_empty() || !self.awaiting_result.is_empty()
    }

    /// Number of lines waiting to be sent
    pub fn queued(&self) -> usize {
        self.outgoing.len()
    }

    #[cfg(test)]
    pub(crate) fn drain_outgoing(&mut self) -> Vec<String> {
        self.outgoing.drain(..).collect()
    }
}
