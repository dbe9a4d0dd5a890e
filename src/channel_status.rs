use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::{fmt, sync::Arc, time::Duration};

/// Channel lifecycle.
///
/// `RemoteClosed` is entered when the server sends `channel.close`; the
/// close reason is kept and returned by every subsequent operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
    Closing,
    RemoteClosed,
}

#[derive(Clone)]
pub struct ChannelStatus {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    state: Mutex<Inner>,
    flow: Condvar,
}

struct Inner {
    state: ChannelState,
    confirm: bool,
    transactional: bool,
    send_flow: bool,
    close_reason: Option<Error>,
    rpc_timeout: Option<Duration>,
}

impl ChannelStatus {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                state: Mutex::new(Inner {
                    state: ChannelState::Opening,
                    confirm: false,
                    transactional: false,
                    send_flow: true,
                    close_reason: None,
                    rpc_timeout: None,
                }),
                flow: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.lock().state
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.inner.state.lock().state = state;
        // state changes can unblock a publisher parked on channel.flow
        self.inner.flow.notify_all();
    }

    pub fn connected(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub(crate) fn is_exited(&self) -> bool {
        matches!(
            self.state(),
            ChannelState::Closed | ChannelState::RemoteClosed
        )
    }

    pub(crate) fn begin_close(&self) -> bool {
        let mut inner = self.inner.state.lock();
        if inner.state == ChannelState::Open {
            inner.state = ChannelState::Closing;
            true
        } else {
            false
        }
    }

    /// Fails unless the channel is `Open`, surfacing the close reason when
    /// there is one.
    pub(crate) fn check_open(&self) -> Result<()> {
        let inner = self.inner.state.lock();
        match inner.state {
            ChannelState::Open => Ok(()),
            state => Err(inner
                .close_reason
                .clone()
                .unwrap_or(Error::InvalidChannelState(state))),
        }
    }

    pub fn confirm(&self) -> bool {
        self.inner.state.lock().confirm
    }

    pub(crate) fn set_confirm(&self) {
        self.inner.state.lock().confirm = true;
    }

    pub fn transactional(&self) -> bool {
        self.inner.state.lock().transactional
    }

    pub(crate) fn set_transactional(&self) {
        self.inner.state.lock().transactional = true;
    }

    pub(crate) fn set_send_flow(&self, active: bool) {
        self.inner.state.lock().send_flow = active;
        self.inner.flow.notify_all();
    }

    /// Parks the caller while the server has us paused with
    /// `channel.flow { active: false }`.
    pub(crate) fn wait_send_flow(&self) -> Result<()> {
        let mut inner = self.inner.state.lock();
        loop {
            match inner.state {
                ChannelState::Open => {}
                state => {
                    return Err(inner
                        .close_reason
                        .clone()
                        .unwrap_or(Error::InvalidChannelState(state)))
                }
            }
            if inner.send_flow {
                return Ok(());
            }
            self.inner.flow.wait(&mut inner);
        }
    }

    pub(crate) fn set_close_reason(&self, error: Error) {
        let mut inner = self.inner.state.lock();
        if inner.close_reason.is_none() {
            inner.close_reason = Some(error);
        }
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.inner.state.lock().rpc_timeout
    }

    pub(crate) fn set_rpc_timeout(&self, timeout: Option<Duration>) {
        self.inner.state.lock().rpc_timeout = timeout;
    }
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.state.lock();
        f.debug_struct("ChannelStatus")
            .field("state", &inner.state)
            .field("confirm", &inner.confirm)
            .field("transactional", &inner.transactional)
            .field("send_flow", &inner.send_flow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn check_open_returns_the_close_reason() {
        let status = ChannelStatus::new();
        status.set_state(ChannelState::Open);
        assert!(status.check_open().is_ok());
        status.set_close_reason(Error::RpcTimeout);
        status.set_state(ChannelState::RemoteClosed);
        assert!(matches!(status.check_open(), Err(Error::RpcTimeout)));
    }

    #[test]
    fn publish_gate_reopens_on_flow_resume() {
        let status = ChannelStatus::new();
        status.set_state(ChannelState::Open);
        status.set_send_flow(false);
        let gate = status.clone();
        let handle = thread::spawn(move || gate.wait_send_flow());
        thread::sleep(Duration::from_millis(20));
        status.set_send_flow(true);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn publish_gate_fails_when_channel_dies() {
        let status = ChannelStatus::new();
        status.set_state(ChannelState::Open);
        status.set_send_flow(false);
        let gate = status.clone();
        let handle = thread::spawn(move || gate.wait_send_flow());
        thread::sleep(Duration::from_millis(20));
        status.set_close_reason(Error::RpcTimeout);
        status.set_state(ChannelState::RemoteClosed);
        assert!(handle.join().unwrap().is_err());
    }
}
