//! Test doubles shared by the unit tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use crate::error::{NodeError, NodeResult};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::openvpn::PublicAddressResolver;
use crate::session::InteractiveSession;
use crate::users::InstallerLauncher;

/// Resolver with a canned answer
pub struct FixedAddress(pub Option<Ipv4Addr>);

#[async_trait]
impl PublicAddressResolver for FixedAddress {
    async fn resolve(&self) -> Option<Ipv4Addr> {
        self.0
    }
}

type Responder = Box<dyn Fn(&CommandSpec) -> Option<NodeResult<CommandOutput>> + Send + Sync>;

/// Runner that answers from a rule list and records every call.
///
/// Rules are tried in order; the first one returning Some wins. Unmatched
/// commands get a successful empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Vec<Responder>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose `program args...` starts with `prefix`
    pub fn on(mut self, prefix: &str, output: CommandOutput) -> Self {
        let prefix = prefix.to_string();
        self.rules.push(Box::new(move |spec| {
            spec.display().starts_with(&prefix).then(|| Ok(output.clone()))
        }));
        self
    }

    /// Answer with an arbitrary closure
    pub fn on_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&CommandSpec) -> Option<NodeResult<CommandOutput>> + Send + Sync + 'static,
    {
        self.rules.push(Box::new(f));
        self
    }

    /// Commands run so far, as display strings
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(CommandSpec::display).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec) -> NodeResult<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }
        for rule in &self.rules {
            if let Some(result) = rule(&spec) {
                return result;
            }
        }
        Ok(CommandOutput::ok(""))
    }
}

/// One move of a scripted installer
pub enum Step {
    /// Print text
    Say(String),
    /// Read one line of input
    Hear,
    /// Stop responding without closing
    Hang,
    /// Create a file, like the installer writing a profile
    WriteFile(PathBuf, String),
}

impl Step {
    pub fn say(text: &str) -> Self {
        Step::Say(text.to_string())
    }

    pub fn write_file(path: PathBuf, contents: &str) -> Self {
        Step::WriteFile(path, contents.to_string())
    }
}

type Transcript = Arc<Mutex<Vec<String>>>;

async fn play(stream: DuplexStream, steps: Vec<Step>, transcript: Transcript) -> Vec<String> {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    for step in steps {
        match step {
            Step::Say(text) => {
                if write_half.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
            }
            Step::Hear => match lines.next_line().await {
                Ok(Some(line)) => transcript.lock().unwrap().push(line.trim().to_string()),
                _ => break,
            },
            Step::Hang => std::future::pending::<()>().await,
            Step::WriteFile(path, contents) => tokio::fs::write(&path, contents).await.unwrap(),
        }
    }

    // Dropping both halves is the installer exiting
    let heard = transcript.lock().unwrap().clone();
    heard
}

fn start_installer(steps: Vec<Step>, transcript: Transcript) -> (InteractiveSession, JoinHandle<Vec<String>>) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(ours);
    let session = InteractiveSession::from_stream("fake-installer", reader, writer, None);
    let peer = tokio::spawn(play(theirs, steps, transcript));
    (session, peer)
}

/// Session talking to an in-process installer that plays `steps`. The
/// handle yields the lines the installer read.
pub fn fake_installer(steps: Vec<Step>) -> (InteractiveSession, JoinHandle<Vec<String>>) {
    start_installer(steps, Transcript::default())
}

/// Launcher handing out queued installer scripts, one per launch
#[derive(Default)]
pub struct FakeLauncher {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    transcripts: Mutex<Vec<Transcript>>,
}

impl FakeLauncher {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            transcripts: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub fn launches(&self) -> usize {
        self.transcripts.lock().unwrap().len()
    }

    /// Lines read by the installer of the `launch`-th session
    pub fn heard(&self, launch: usize) -> Vec<String> {
        self.transcripts.lock().unwrap()[launch].lock().unwrap().clone()
    }
}

#[async_trait]
impl InstallerLauncher for FakeLauncher {
    async fn launch(&self) -> NodeResult<InteractiveSession> {
        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| NodeError::EnvironmentUnavailable("no installer script queued".to_string()))?;
        let transcript = Transcript::default();
        self.transcripts.lock().unwrap().push(transcript.clone());
        let (session, _peer) = start_installer(steps, transcript);
        Ok(session)
    }
}
