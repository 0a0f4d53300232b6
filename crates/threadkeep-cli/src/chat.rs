use std::io::Write;
use threadkeep_core::{Message, Role, SessionKey};
use threadkeep_session::Conversation;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

/// Shown for a session without history. Never persisted.
pub const GREETING: &str = "Hi! How can I help you?";

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "bot",
        Role::System => "system",
    }
}

fn print_messages(out: &mut impl Write, messages: &[Message]) -> std::io::Result<()> {
    for message in messages {
        writeln!(out, "{}> {}", label(message.role), message.content)?;
    }
    Ok(())
}

/// Reads lines from `input` until EOF or `/quit`, running each as a turn.
///
/// Backend failures are reported and the loop keeps going, so a restarted
/// server picks the conversation up again.
pub async fn run<R, W>(
    conversation: &Conversation,
    session_key: &SessionKey,
    input: R,
    out: &mut W,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    writeln!(out, "session: {session_key}")?;
    match conversation.history(session_key).await {
        Ok(history) if history.is_empty() => writeln!(out, "bot> {GREETING}")?,
        Ok(history) => print_messages(out, &history)?,
        Err(e) => writeln!(out, "error: {e}")?,
    }
    out.flush()?;

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/history" => match conversation.history(session_key).await {
                Ok(history) if history.is_empty() => writeln!(out, "(no history)")?,
                Ok(history) => print_messages(out, &history)?,
                Err(e) => writeln!(out, "error: {e}")?,
            },
            "/forget" => match conversation.forget(session_key).await {
                Ok(()) => {
                    writeln!(out, "(session forgotten)")?;
                    writeln!(out, "bot> {GREETING}")?;
                }
                Err(e) => writeln!(out, "error: {e}")?,
            },
            text => match conversation.run_turn(session_key, text).await {
                Ok(replies) => print_messages(out, &replies)?,
                Err(e) => {
                    if e.is_recoverable() {
                        warn!(session_key = %session_key, error = %e, "Turn saved for replay only");
                    }
                    writeln!(out, "error: {e}")?;
                }
            },
        }
        out.flush()?;
    }
    Ok(())
}
