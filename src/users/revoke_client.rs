//! "Revoke an existing client" dialogue with the installer

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{NodeError, NodeResult};
use crate::session::{InteractiveSession, Pattern, SessionError};

/// Menu entry for revoking a client
const REVOKE_OPTION: &str = "2";

const MENU_PROMPT: &str = r"Option:|Select an option:";
const LIST_BANNER: &str = "Select the client to revoke";
const CLIENT_PROMPT: &str = "Client:";
const CONFIRM_PROMPT: &str =
    r"Confirm .*revocation\?.*\[y/N\]:|Confirm .*revocation\?.*:|Confirm .*revocation\?";

/// `   3) alice` entries of the client list
static CLIENT_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\)[ \t]*([^\r\n]+)").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The installer does not list the client
    NotFound,
}

#[derive(Debug, Clone, Copy)]
pub struct RevokeTimeouts {
    pub step: Duration,
    pub finish: Duration,
}

/// Installer menu number of `name` in a client listing
pub fn find_client_number(listing: &str, name: &str) -> Option<String> {
    CLIENT_ENTRY
        .captures_iter(listing)
        .find(|caps| caps.get(2).map(|m| m.as_str().trim()) == Some(name))
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}

fn pattern(re: &str) -> NodeResult<Pattern> {
    Pattern::regex(re).map_err(|e| NodeError::ParseError(e.to_string()))
}

/// Wait for a prompt whose absence is survivable. Returns whether it
/// showed up; a later critical step decides whether the session is
/// still usable.
async fn expect_optional(
    session: &mut InteractiveSession,
    pattern: Pattern,
    timeout: Duration,
) -> NodeResult<bool> {
    match session.expect(pattern, timeout).await {
        Ok(_) => Ok(true),
        Err(SessionError::Timeout { .. }) | Err(SessionError::Closed { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Drive the installer through revoking `name`
pub async fn run_revoke_client(
    session: &mut InteractiveSession,
    name: &str,
    timeouts: &RevokeTimeouts,
) -> NodeResult<DeleteOutcome> {
    session.expect(pattern(MENU_PROMPT)?, timeouts.step).await?;
    session.send_line(REVOKE_OPTION).await?;

    if !expect_optional(session, Pattern::literal(LIST_BANNER), timeouts.step).await? {
        info!("Didn't see the client list header");
    }

    let listing = match session.expect(Pattern::literal(CLIENT_PROMPT), timeouts.step).await {
        Ok(m) => m.before,
        Err(e) => {
            error!("Timeout waiting for client list");
            return Err(e.into());
        }
    };

    let number = match find_client_number(&listing, name) {
        Some(number) => number,
        None => {
            error!("User '{}' not found for delete", name);
            return Ok(DeleteOutcome::NotFound);
        }
    };

    info!("Revoking user '{}' -> number {}", name, number);
    session.send_line(&number).await?;

    if expect_optional(session, pattern(CONFIRM_PROMPT)?, timeouts.step).await? {
        session.send_line("y").await?;
    } else {
        warn!("Confirmation prompt not seen; trying to continue");
    }

    session.expect_any(&[Pattern::Eof], timeouts.finish).await.map_err(|e| {
        error!("Timeout waiting for script to finish");
        NodeError::from(e)
    })?;

    Ok(DeleteOutcome::Deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_installer, Step};

    const MENU: &str = "\
OpenVPN is already installed.\n\nSelect an option:\n   1) Add a new client\n   2) Revoke an existing client\n   3) Remove OpenVPN\n   4) Exit\nOption: ";

    const LISTING: &str = "\nSelect the client to revoke:\n     1) alice\n     2) bob\n     3) alice2\nClient: ";

    fn fast() -> RevokeTimeouts {
        RevokeTimeouts {
            step: Duration::from_millis(300),
            finish: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_find_client_number_exact_match() {
        assert_eq!(find_client_number(LISTING, "alice").as_deref(), Some("1"));
        assert_eq!(find_client_number(LISTING, "alice2").as_deref(), Some("3"));
        assert_eq!(find_client_number("   12) zed\r\n", "zed").as_deref(), Some("12"));
        assert_eq!(find_client_number(LISTING, "ali"), None);
        assert_eq!(find_client_number(LISTING, "ghost"), None);
    }

    #[tokio::test]
    async fn test_revoke_dialogue() {
        let (mut session, peer) = fake_installer(vec![
            Step::say(MENU),
            Step::Hear,
            Step::say(LISTING),
            Step::Hear,
            Step::say("\nConfirm bob revocation? [y/N]: "),
            Step::Hear,
            Step::say("\nbob revoked!\n"),
        ]);

        let outcome = run_revoke_client(&mut session, "bob", &fast()).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(peer.await.unwrap(), vec!["2", "2", "y"]);
    }

    #[tokio::test]
    async fn test_revoke_unknown_client() {
        let (mut session, peer) = fake_installer(vec![Step::say(MENU), Step::Hear, Step::say(LISTING), Step::Hang]);

        let outcome = run_revoke_client(&mut session, "ghost", &fast()).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::NotFound);
        peer.abort();
    }

    #[tokio::test]
    async fn test_revoke_without_confirmation_prompt() {
        let (mut session, peer) = fake_installer(vec![
            Step::say(MENU),
            Step::Hear,
            Step::say(LISTING),
            Step::Hear,
            Step::say("\nalice revoked!\n"),
        ]);

        let outcome = run_revoke_client(&mut session, "alice", &fast()).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        // No "y" was typed
        assert_eq!(peer.await.unwrap(), vec!["2", "1"]);
    }

    #[tokio::test]
    async fn test_revoke_missing_client_prompt_is_fatal() {
        let (mut session, _peer) = fake_installer(vec![Step::say(MENU), Step::Hear, Step::Hang]);

        let err = run_revoke_client(&mut session, "alice", &fast()).await.unwrap_err();
        assert!(matches!(err, NodeError::Timeout { .. }));
    }
}
