//! Per-connection protocol state machine.
//!
//! `AwaitingHeader -> AwaitingBody -> Dispatching -> AwaitingHeader`, until
//! the peer disconnects or any I/O or decode error moves it to `Closed`.
//! Authentication happens before a session is built.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::protocol::frame::{write_frame, FrameReader};
use crate::protocol::{Command, Credentials, ProtocolError};

/// Read the peer's kernel-reported credentials.
///
/// # Errors
///
/// [`ProtocolError::Io`] if the lookup fails and
/// [`ProtocolError::Unauthenticated`] if the pid is absent or 0.
pub fn peer_credentials(stream: &UnixStream) -> Result<Credentials, ProtocolError> {
    let cred = stream.peer_cred()?;
    let pid = cred
        .pid()
        .and_then(|pid| u64::try_from(pid).ok())
        .filter(|pid| *pid != 0)
        .ok_or(ProtocolError::Unauthenticated)?;
    Ok(Credentials {
        pid,
        uid: cred.uid(),
        gid: cred.gid(),
    })
}

#[derive(Debug)]
enum State {
    AwaitingHeader,
    AwaitingBody(u32),
    Dispatching(Command),
    Closed,
}

/// One authenticated client connection.
pub struct Session<S> {
    id: u64,
    stream: S,
    creds: Credentials,
    dispatcher: Arc<Dispatcher>,
    reader: FrameReader,
    handled: u64,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already authenticated stream.
    pub fn new(stream: S, creds: Credentials, dispatcher: Arc<Dispatcher>, max_frame: u32) -> Self {
        Self {
            id: rand::random(),
            stream,
            creds,
            dispatcher,
            reader: FrameReader::new(max_frame),
            handled: 0,
        }
    }

    /// Serve requests until the connection closes. Returns the number of
    /// commands answered.
    pub async fn run(mut self) -> u64 {
        info!(session = self.id, pid = self.creds.pid, uid = self.creds.uid, "session opened");

        let mut state = State::AwaitingHeader;
        loop {
            state = match state {
                State::AwaitingHeader => match self.reader.read_header(&mut self.stream).await {
                    Ok(Some(header)) => State::AwaitingBody(header.len),
                    Ok(None) => State::Closed,
                    Err(err) => self.fail(&err),
                },
                State::AwaitingBody(len) => {
                    match self.reader.read_command(&mut self.stream, len).await {
                        Ok(mut command) => {
                            command.stamp(self.creds);
                            State::Dispatching(command)
                        }
                        Err(err) => self.fail(&err),
                    }
                }
                State::Dispatching(command) => {
                    let kind = command.kind;
                    let response = self.dispatcher.dispatch(command).await;
                    match write_frame(&mut self.stream, &response).await {
                        Ok(()) => {
                            self.handled = self.handled.saturating_add(1);
                            debug!(session = self.id, kind, success = response.is_success(), "response sent");
                            State::AwaitingHeader
                        }
                        Err(err) => self.fail(&err),
                    }
                }
                State::Closed => break,
            };
        }

        info!(session = self.id, handled = self.handled, "session closed");
        self.handled
    }

    fn fail(&self, err: &ProtocolError) -> State {
        warn!(session = self.id, pid = self.creds.pid, error = %err, "closing session");
        State::Closed
    }
}
