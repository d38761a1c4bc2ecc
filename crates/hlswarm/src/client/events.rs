use std::fmt;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why an attached session ended with a `Terminated` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The randomized session length ran out
    SessionExpired,
    /// Playback went past the last VOD segment
    EndOfStream,
    /// The fleet asked for it
    Requested,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEventKind {
    Attached,
    Terminated(EndReason),
    Killed,
    Aborted(String),
    Redirected {
        /// Whether the session had announced itself as attached
        attached: bool,
    },
    BadService,
    VeryBadService,
    SlowServer,
}

impl ClientEventKind {
    /// Terminal events end a session; exactly one is emitted per session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Terminated(_) | Self::Killed | Self::Aborted(_) | Self::Redirected { .. }
        )
    }
}

/// Notification from a simulated client to the fleet manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub session: SessionId,
    pub kind: ClientEventKind,
}

pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    Terminate,
    Kill,
    Abort,
    Reattach,
}

/// The only way the fleet reaches a running client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    session: SessionId,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    pub fn new(session: SessionId) -> (Self, mpsc::UnboundedReceiver<ClientCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { session, commands }, rx)
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn terminate(&self) -> bool {
        self.send(ClientCommand::Terminate)
    }

    pub fn kill(&self) -> bool {
        self.send(ClientCommand::Kill)
    }

    pub fn abort(&self) -> bool {
        self.send(ClientCommand::Abort)
    }

    pub fn reattach(&self) -> bool {
        self.send(ClientCommand::Reattach)
    }

    /// Returns `false` when the client task is already gone.
    fn send(&self, command: ClientCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}
