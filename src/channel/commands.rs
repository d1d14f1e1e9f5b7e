//! Privileged chat commands: `/pair`, `/new`, `/remember`.
//!
//! [`CommandHandler::handle`] is a pure decision function. It never touches
//! storage or the network; the adapter turns a [`CommandAction`] into effects.

use chrono::{DateTime, Utc};

use super::pairing::{PairingDecision, PairingGuard};

/// Response for a failed (but not yet locked out) pairing attempt.
pub const INVALID_TOKEN_RESPONSE: &str = "Invalid pairing token.";

/// Response when `/pair` arrives but no token is configured.
pub const PAIRING_DISABLED_RESPONSE: &str =
    "Pairing is disabled. Ask the owner to add your number to the whitelist.";

/// Side effect requested by a recognised command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    /// Add the contained sender identity to the whitelist.
    Pair(String),
    /// Start a fresh assistant session.
    NewSession,
    /// Store the contained note.
    Remember(String),
}

/// Result of classifying one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutcome {
    /// `false` means the text should go to the assistant unchanged.
    pub handled: bool,
    /// Text to send back to the sender, if any.
    pub response: Option<String>,
    /// Effect to apply, if any.
    pub action: Option<CommandAction>,
}

impl CommandOutcome {
    fn pass_through() -> Self {
        Self::default()
    }

    fn reply(text: impl Into<String>) -> Self {
        Self {
            handled: true,
            response: Some(text.into()),
            action: None,
        }
    }

    fn act(action: CommandAction) -> Self {
        Self {
            handled: true,
            response: None,
            action: Some(action),
        }
    }
}

/// Parses commands and gates everything except `/pair` behind the whitelist.
#[derive(Debug)]
pub struct CommandHandler {
    pairing: PairingGuard,
}

impl CommandHandler {
    /// Create a handler around a pairing guard.
    pub fn new(pairing: PairingGuard) -> Self {
        Self { pairing }
    }

    /// Access the pairing guard (for status output and tests).
    pub fn pairing(&self) -> &PairingGuard {
        &self.pairing
    }

    /// Classify `text` from `sender` using the wall clock.
    pub fn handle(&self, sender: &str, text: &str, is_whitelisted: bool) -> CommandOutcome {
        self.handle_at(sender, text, is_whitelisted, Utc::now())
    }

    /// Classify `text` from `sender` as of `now`.
    pub fn handle_at(
        &self,
        sender: &str,
        text: &str,
        is_whitelisted: bool,
        now: DateTime<Utc>,
    ) -> CommandOutcome {
        let trimmed = text.trim();
        let (command, args) = split_command(trimmed);

        if command.as_deref() == Some("/pair") {
            return self.handle_pair(sender, args, now);
        }

        if !is_whitelisted {
            return CommandOutcome::reply(self.access_restricted(sender));
        }

        match command.as_deref() {
            Some("/new") => CommandOutcome::act(CommandAction::NewSession),
            Some("/remember") if args.is_empty() => {
                CommandOutcome::reply("Usage: /remember <text to remember>")
            }
            Some("/remember") => CommandOutcome::act(CommandAction::Remember(args.to_owned())),
            _ => CommandOutcome::pass_through(),
        }
    }

    fn handle_pair(&self, sender: &str, token: &str, now: DateTime<Utc>) -> CommandOutcome {
        if !self.pairing.is_enabled() {
            return CommandOutcome::reply(PAIRING_DISABLED_RESPONSE);
        }
        if let Some(retry_after) = self.pairing.locked_out_for(sender, now) {
            return CommandOutcome::reply(lockout_response(retry_after));
        }
        if token.is_empty() {
            return CommandOutcome::reply("Usage: /pair <token>");
        }

        match self.pairing.attempt(sender, token, now) {
            PairingDecision::Disabled => CommandOutcome::reply(PAIRING_DISABLED_RESPONSE),
            PairingDecision::Paired => CommandOutcome::act(CommandAction::Pair(sender.to_owned())),
            PairingDecision::Invalid { .. } => CommandOutcome::reply(INVALID_TOKEN_RESPONSE),
            PairingDecision::LockedOut { retry_after } => {
                CommandOutcome::reply(lockout_response(retry_after))
            }
        }
    }

    fn access_restricted(&self, sender: &str) -> String {
        let instructions = if self.pairing.is_enabled() {
            "Send /pair <token> to get access."
        } else {
            "Pairing is disabled. Ask the owner to add your number to the whitelist."
        };
        format!("Access restricted.\nYour ID: {sender}\n{instructions}")
    }
}

/// Split `"/cmd rest of text"` into a lower-cased command word and the
/// trimmed remainder. Returns `None` when the text is not a command.
fn split_command(text: &str) -> (Option<String>, &str) {
    if !text.starts_with('/') {
        return (None, text);
    }
    match text.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (Some(cmd.to_lowercase()), rest.trim()),
        None => (Some(text.to_lowercase()), ""),
    }
}

fn lockout_response(retry_after: chrono::Duration) -> String {
    let secs = retry_after.num_seconds().max(1);
    let minutes = secs.saturating_add(59) / 60;
    let unit = if minutes == 1 { "minute" } else { "minutes" };
    format!("Too many failed pairing attempts. Try again in {minutes} {unit}.")
}
