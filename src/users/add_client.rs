//! "Add a new client" dialogue with the installer
//!
//! ```text
//! AwaitingMenu --Option:--> SentAddOption --Name:--> NameSent
//! NameSent --Name: again--> Rejected
//! NameSent --banner-------> Draining --EOF/timeout--> Finished
//! NameSent --EOF----------> Finished
//! NameSent --timeout------> NameSent (next attempt) | Exhausted
//! ```

use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{NodeError, NodeResult};
use crate::session::{InteractiveSession, Pattern, SessionError};

/// Menu entry for adding a client
const ADD_OPTION: &str = "1";

const MENU_PROMPT: &str = "Option:";
const NAME_PROMPT: &str = "Name:";
const INVALID_NAME: &str = "invalid name";
const ADDED_BANNER: &str = r"added\. Configuration available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddState {
    AwaitingMenu,
    SentAddOption,
    /// Name sent; `waits` completion waits have timed out so far
    NameSent { waits: u32 },
    Draining,
    Finished,
    /// The installer asked for the name again
    Rejected,
    /// Every completion wait timed out
    Exhausted,
    /// Input that makes no sense in the current state
    Aborted,
}

impl AddState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AddState::Finished | AddState::Rejected | AddState::Exhausted | AddState::Aborted
        )
    }
}

/// What the installer just did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddSignal {
    MenuPrompt,
    NamePrompt,
    Banner,
    Eof,
    Timeout,
}

/// Pure transition table. `max_waits` bounds the completion waits after
/// the name was sent.
pub fn transition(state: AddState, signal: AddSignal, max_waits: u32) -> AddState {
    use AddSignal::*;
    use AddState::*;

    match (state, signal) {
        (AwaitingMenu, MenuPrompt) => SentAddOption,
        (SentAddOption, NamePrompt) => NameSent { waits: 0 },
        (NameSent { .. }, NamePrompt) => Rejected,
        (NameSent { .. }, Banner) => Draining,
        (NameSent { .. }, Eof) => Finished,
        (NameSent { waits }, Timeout) => {
            if waits + 1 >= max_waits {
                Exhausted
            } else {
                NameSent { waits: waits + 1 }
            }
        }
        (Draining, Eof) | (Draining, Timeout) => Finished,
        (terminal, _) if terminal.is_terminal() => terminal,
        _ => Aborted,
    }
}

/// Deadlines for each wait of the dialogue
#[derive(Debug, Clone, Copy)]
pub struct AddTimeouts {
    pub menu: Duration,
    pub name_prompt: Duration,
    pub completion: Duration,
    pub drain: Duration,
}

/// How the dialogue ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddReport {
    pub state: AddState,
    /// Completion waits performed after the name was sent
    pub completion_waits: u32,
    /// Whether the success banner was seen
    pub banner_seen: bool,
}

/// Drive the installer through adding `name`.
///
/// Missing menu or name prompts are hard failures and come back as errors.
/// Everything after the name was sent ends in a terminal [`AddState`].
pub async fn run_add_client(
    session: &mut InteractiveSession,
    name: &str,
    timeouts: &AddTimeouts,
    max_waits: u32,
) -> NodeResult<AddReport> {
    let completion_patterns = [
        Pattern::literal(NAME_PROMPT),
        Pattern::regex(ADDED_BANNER).map_err(|e| NodeError::ParseError(e.to_string()))?,
        Pattern::Eof,
    ];

    let mut state = AddState::AwaitingMenu;
    let mut completion_waits = 0;
    let mut banner_seen = false;

    while !state.is_terminal() {
        let signal = match state {
            AddState::AwaitingMenu => {
                session.expect(Pattern::literal(MENU_PROMPT), timeouts.menu).await?;
                session.send_line(ADD_OPTION).await?;
                AddSignal::MenuPrompt
            }
            AddState::SentAddOption => {
                let prompts = [Pattern::literal(NAME_PROMPT), Pattern::literal(INVALID_NAME)];
                session.expect_any(&prompts, timeouts.name_prompt).await?;
                session.send_line(name).await?;
                AddSignal::NamePrompt
            }
            AddState::NameSent { waits } => {
                completion_waits += 1;
                debug!("Waiting for installer to finish (attempt {})", waits + 1);
                match session.expect_any(&completion_patterns, timeouts.completion).await {
                    Ok(m) if m.index == 0 => {
                        error!("User name '{}' is invalid or already exists in script", name);
                        AddSignal::NamePrompt
                    }
                    Ok(m) if m.index == 1 => {
                        info!("User '{}' created successfully", name);
                        banner_seen = true;
                        AddSignal::Banner
                    }
                    Ok(_) => {
                        info!("Script finished for user '{}'", name);
                        AddSignal::Eof
                    }
                    Err(SessionError::Timeout { .. }) => {
                        warn!("No completion signal for '{}' yet", name);
                        AddSignal::Timeout
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            AddState::Draining => match session.expect_any(&[Pattern::Eof], timeouts.drain).await {
                Ok(_) => AddSignal::Eof,
                Err(SessionError::Timeout { .. }) => {
                    debug!("Installer still running after banner, not waiting further");
                    AddSignal::Timeout
                }
                Err(e) => return Err(e.into()),
            },
            _ => break,
        };

        state = transition(state, signal, max_waits);
    }

    if state == AddState::Exhausted {
        error!("Max retries reached for user '{}'", name);
    }

    Ok(AddReport {
        state,
        completion_waits,
        banner_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_installer, Step};

    fn fast() -> AddTimeouts {
        AddTimeouts {
            menu: Duration::from_millis(500),
            name_prompt: Duration::from_millis(500),
            completion: Duration::from_millis(40),
            drain: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = AddState::AwaitingMenu;
        for signal in [AddSignal::MenuPrompt, AddSignal::NamePrompt, AddSignal::Banner, AddSignal::Eof] {
            state = transition(state, signal, 3);
        }
        assert_eq!(state, AddState::Finished);
    }

    #[test]
    fn test_reprompt_is_terminal() {
        let state = transition(AddState::NameSent { waits: 1 }, AddSignal::NamePrompt, 3);
        assert_eq!(state, AddState::Rejected);
        assert_eq!(transition(state, AddSignal::Eof, 3), AddState::Rejected);
    }

    #[test]
    fn test_timeouts_stop_at_bound() {
        let mut state = AddState::NameSent { waits: 0 };
        let mut waits = 0;
        while !state.is_terminal() {
            waits += 1;
            state = transition(state, AddSignal::Timeout, 3);
        }
        assert_eq!(state, AddState::Exhausted);
        assert_eq!(waits, 3);
    }

    #[test]
    fn test_unexpected_signal_aborts() {
        assert_eq!(transition(AddState::AwaitingMenu, AddSignal::Banner, 3), AddState::Aborted);
    }

    #[tokio::test]
    async fn test_dialogue_with_banner() {
        let (mut session, peer) = fake_installer(vec![
            Step::say("Welcome\n   1) Add a new client\n   4) Exit\nOption: "),
            Step::Hear,
            Step::say("\nProvide a name for the client:\nName: "),
            Step::Hear,
            Step::say("\nalice added. Configuration available in: /root/alice.ovpn\n"),
        ]);

        let report = run_add_client(&mut session, "alice", &fast(), 3).await.unwrap();
        assert_eq!(report.state, AddState::Finished);
        assert!(report.banner_seen);
        assert_eq!(peer.await.unwrap(), vec!["1", "alice"]);
    }

    #[tokio::test]
    async fn test_dialogue_eof_without_banner() {
        let (mut session, _peer) = fake_installer(vec![
            Step::say("Option: "),
            Step::Hear,
            Step::say("Name: "),
            Step::Hear,
        ]);

        let report = run_add_client(&mut session, "bob", &fast(), 3).await.unwrap();
        assert_eq!(report.state, AddState::Finished);
        assert!(!report.banner_seen);
    }

    #[tokio::test]
    async fn test_dialogue_rejected_name() {
        let (mut session, _peer) = fake_installer(vec![
            Step::say("Option: "),
            Step::Hear,
            Step::say("Name: "),
            Step::Hear,
            Step::say("bob: invalid name.\nName: "),
            Step::Hang,
        ]);

        let report = run_add_client(&mut session, "bob", &fast(), 3).await.unwrap();
        assert_eq!(report.state, AddState::Rejected);
        assert_eq!(report.completion_waits, 1);
    }

    #[tokio::test]
    async fn test_dialogue_exhausts_after_three_waits() {
        let (mut session, _peer) = fake_installer(vec![
            Step::say("Option: "),
            Step::Hear,
            Step::say("Name: "),
            Step::Hear,
            Step::Hang,
        ]);

        let report = run_add_client(&mut session, "carol", &fast(), 3).await.unwrap();
        assert_eq!(report.state, AddState::Exhausted);
        assert_eq!(report.completion_waits, 3);
    }

    #[tokio::test]
    async fn test_missing_menu_is_fatal() {
        let (mut session, _peer) = fake_installer(vec![Step::say("Something else\n"), Step::Hang]);
        let timeouts = AddTimeouts {
            menu: Duration::from_millis(30),
            ..fast()
        };

        let err = run_add_client(&mut session, "dave", &timeouts, 3).await.unwrap_err();
        assert!(matches!(err, NodeError::Timeout { .. }));
    }
}
