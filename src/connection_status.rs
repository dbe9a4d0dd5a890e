use crate::Error;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// Connection lifecycle, from the protocol header to teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    ProtocolHeaderSent,
    StartReceived,
    TuneReceived,
    OpenSent,
    Open,
    Closing,
    ClosedByServer,
    ClosedByClient,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Closed
    }
}

#[derive(Clone, Default)]
pub struct ConnectionStatus {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    blocked: bool,
    error: Option<Error>,
}

impl ConnectionStatus {
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Atomically moves `Open` to `Closing`; the caller that wins the
    /// transition is the one performing the close handshake.
    pub(crate) fn begin_close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Open {
            inner.state = ConnectionState::Closing;
            true
        } else {
            false
        }
    }

    /// Whether the server told us it stopped accepting publishes
    /// (`connection.blocked`). Informational, no throttling is applied.
    pub fn blocked(&self) -> bool {
        self.inner.lock().blocked
    }

    pub(crate) fn block(&self) {
        self.inner.lock().blocked = true;
    }

    pub(crate) fn unblock(&self) {
        self.inner.lock().blocked = false;
    }

    pub(crate) fn set_error(&self, error: Error) {
        let mut inner = self.inner.lock();
        if inner.error.is_none() {
            inner.error = Some(error);
        }
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.inner.lock().error.clone()
    }
}

impl fmt::Debug for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionStatus")
            .field("state", &inner.state)
            .field("blocked", &inner.blocked)
            .finish()
    }
}
