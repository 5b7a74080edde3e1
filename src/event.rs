
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    /// one of the sides closed the connection on purpose
    Graceful,
    TimedOut,
    /// the peer violated the protocol or sent data that could not be handled
    Error,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectAttemptFailedReason {
    TimedOut,
    Error,
}

/// Notifications a connector raises for the application
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectorEvent {
    /// The peer answered the handshake with a different passphrase
    BadPassphrase,
    ConnectAttemptFailed {
        reason: ConnectAttemptFailedReason,
    },
    Connected,
    Disconnected {
        reason: DisconnectReason,
        message: String,
    },
}
