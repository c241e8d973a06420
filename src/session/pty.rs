//! Pseudo-terminal backed sessions

use nix::pty::{openpty, Winsize};
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

use super::{InteractiveSession, SessionError};

/// Spawn `program` on a fresh pseudo-terminal.
///
/// The child becomes a session leader with the pty as its controlling
/// terminal and sees only the variables in `env`. Echo is turned off so the
/// output buffer holds what the program printed, not what we typed.
pub fn spawn_pty(
    program: &Path,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> Result<InteractiveSession, SessionError> {
    let winsize = Winsize {
        ws_row: 40,
        ws_col: 200,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(Some(&winsize), None::<&Termios>)
        .map_err(|e| SessionError::Spawn(format!("openpty failed: {}", e)))?;

    let mut attrs = termios::tcgetattr(&pty.slave)
        .map_err(|e| SessionError::Spawn(format!("tcgetattr failed: {}", e)))?;
    attrs.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(&pty.slave, SetArg::TCSANOW, &attrs)
        .map_err(|e| SessionError::Spawn(format!("tcsetattr failed: {}", e)))?;

    let stdout = pty.slave.try_clone()?;
    let stderr = pty.slave.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::from(pty.slave))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);

    // SAFETY: only async-signal-safe libc calls between fork and exec
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| SessionError::Spawn(format!("{}: {}", program.display(), e)))?;
    // Dropping the command closes our copies of the slave side
    drop(cmd);

    info!("Spawned {} (pid {:?}) on a pty", program.display(), child.id());

    let master = File::from(pty.master);
    let writer = tokio::fs::File::from_std(master.try_clone()?);
    let reader = tokio::fs::File::from_std(master);

    let label = program
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.display().to_string());

    Ok(InteractiveSession::from_stream(label, reader, writer, Some(child)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Pattern;
    use std::time::Duration;

    fn path_env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        env
    }

    #[tokio::test]
    async fn test_pty_prompt_dialogue() {
        let script = "printf 'Name: '; read name; echo \"hello $name\"".to_string();
        let mut session = spawn_pty(Path::new("/bin/sh"), &["-c".to_string(), script], &path_env()).unwrap();

        session
            .expect(Pattern::literal("Name:"), Duration::from_secs(5))
            .await
            .unwrap();
        session.send_line("alice").await.unwrap();
        let m = session
            .expect(Pattern::literal("hello alice"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(m.matched, "hello alice");

        let m = session
            .expect_any(&[Pattern::Eof], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(m.index, 0);
        assert_eq!(session.close(false).await, Some(0));
    }

    #[tokio::test]
    async fn test_pty_environment_is_cleared() {
        let mut session = spawn_pty(
            Path::new("/bin/sh"),
            &["-c".to_string(), "echo \"home=[$HOME]\"".to_string()],
            &path_env(),
        )
        .unwrap();

        let m = session
            .expect(Pattern::regex(r"home=\[[^\]]*\]").unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(m.matched, "home=[]");
        session.close(true).await;
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = spawn_pty(Path::new("/nonexistent/installer.sh"), &[], &path_env());
        assert!(matches!(result, Err(SessionError::Spawn(_))));
    }
}
