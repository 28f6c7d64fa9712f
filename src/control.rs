use log::{debug, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

/// An out of band request for the training loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ControlRequest {
    #[default]
    None,
    /// Leave the loop as soon as possible.
    Stop,
    /// Write a checkpoint at the next opportunity.
    Snapshot,
}

/// Something the training loop polls, without blocking, for requests.
pub trait ControlSource: Send {
    fn poll(&mut self) -> ControlRequest;
}

impl<F> ControlSource for F
where
    F: FnMut() -> ControlRequest + Send,
{
    fn poll(&mut self) -> ControlRequest {
        self()
    }
}

/// A control source that never requests anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoControl;

impl ControlSource for NoControl {
    fn poll(&mut self) -> ControlRequest {
        ControlRequest::None
    }
}

/// The sending half of a control channel, cheap to clone.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: UnboundedSender<ControlRequest>,
}

impl ControlHandle {
    /// Queues `request` for the training loop.
    ///
    /// # Returns
    /// `false` if the loop is gone.
    pub fn request(&self, request: ControlRequest) -> bool {
        self.tx.send(request).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.request(ControlRequest::Stop)
    }

    pub fn snapshot(&self) -> bool {
        self.request(ControlRequest::Snapshot)
    }
}

/// The polled half of a control channel.
///
/// Each poll hands out one queued request, in the order they were sent.
#[derive(Debug)]
pub struct ChannelControl {
    rx: UnboundedReceiver<ControlRequest>,
}

impl ControlSource for ChannelControl {
    fn poll(&mut self) -> ControlRequest {
        match self.rx.try_recv() {
            Ok(request) => request,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => ControlRequest::None,
        }
    }
}

/// Creates a control channel, the handle can be moved to any task or thread.
pub fn control_channel() -> (ControlHandle, ChannelControl) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlHandle { tx }, ChannelControl { rx })
}

/// What each process signal turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalActions {
    pub interrupt: ControlRequest,
    pub hangup: ControlRequest,
}

impl Default for SignalActions {
    fn default() -> Self {
        Self {
            interrupt: ControlRequest::Stop,
            hangup: ControlRequest::Snapshot,
        }
    }
}

/// Spawns a task forwarding process signals as control requests.
///
/// SIGHUP is only listened to on unix. The task ends once the loop drops its
/// `ChannelControl`.
///
/// # Arguments
/// * `actions` - The request each signal maps to.
///
/// # Returns
/// The control source to hand to the solver.
pub fn signal_control(actions: SignalActions) -> ChannelControl {
    let (handle, control) = control_channel();
    tokio::spawn(forward_signals(handle, actions));
    control
}

async fn forward_signals(handle: ControlHandle, actions: SignalActions) {
    #[cfg(unix)]
    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("failed to listen for SIGHUP: {e}");
            None
        }
    };

    loop {
        #[cfg(unix)]
        let hangup_recv = async {
            match hangup.as_mut() {
                Some(stream) => stream.recv().await,
                None => std::future::pending().await,
            }
        };
        #[cfg(not(unix))]
        let hangup_recv = std::future::pending::<Option<()>>();

        let request = tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => actions.interrupt,
                Err(e) => {
                    warn!("failed to listen for SIGINT: {e}");
                    return;
                }
            },
            Some(()) = hangup_recv => actions.hangup,
            else => return,
        };

        debug!("signal received, requesting {request:?}");
        if request != ControlRequest::None && !handle.request(request) {
            return;
        }
    }
}
