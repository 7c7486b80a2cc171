//! Turns process signals into [`ControlEvent`]s.
//!
//! Signal streams are read on a dedicated thread running a current-thread
//! tokio runtime. The bridge only posts events; the scheduler's main loop
//! reacts to them. The one exception is the third stop signal, which exits
//! the process from the bridge thread.

use crate::error::{Result, SchedulerError};
use crossbeam_channel::Sender;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// First SIGINT/SIGTERM: graceful shutdown.
    Stop,
    /// Second SIGINT/SIGTERM: terminate children and shut down.
    Terminate,
    /// SIGHUP: stop gracefully and start a fresh instance.
    Restart,
}

/// What the `count`-th stop signal means. `None` means exit right away.
pub fn escalate(count: u32) -> Option<ControlEvent> {
    match count {
        0 | 1 => Some(ControlEvent::Stop),
        2 => Some(ControlEvent::Terminate),
        _ => None,
    }
}

/// Keeps the bridge thread alive. Dropping it stops listening.
pub struct SignalBridge {
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub fn install(events: Sender<ControlEvent>) -> Result<SignalBridge> {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

    std::thread::Builder::new()
        .name("agrec-signals".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("failed to create signal runtime: {e}")));
                    return;
                }
            };
            runtime.block_on(async move {
                let streams = (
                    signal(SignalKind::interrupt()),
                    signal(SignalKind::terminate()),
                    signal(SignalKind::hangup()),
                );
                let (mut sigint, mut sigterm, mut sighup) = match streams {
                    (Ok(i), Ok(t), Ok(h)) => (i, t, h),
                    (i, t, h) => {
                        let e = [i.err(), t.err(), h.err()].into_iter().flatten().next();
                        let message = e.map(|e| e.to_string()).unwrap_or_default();
                        let _ = ready_tx.send(Err(format!("failed to install signal handlers: {message}")));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let mut stops = 0u32;
                let mut stop_rx = stop_rx;
                loop {
                    let stop_signal = tokio::select! {
                        _ = sigint.recv() => true,
                        _ = sigterm.recv() => true,
                        _ = sighup.recv() => false,
                        _ = &mut stop_rx => break,
                    };
                    let event = if stop_signal {
                        stops += 1;
                        match escalate(stops) {
                            Some(event) => event,
                            None => {
                                error!("third stop signal, exiting now");
                                std::process::exit(1);
                            }
                        }
                    } else {
                        ControlEvent::Restart
                    };
                    warn!(?event, "signal received");
                    if events.send(event).is_err() {
                        break;
                    }
                }
            });
        })
        .map_err(|source| SchedulerError::ThreadSpawn {
            name: "agrec-signals".into(),
            source,
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(SignalBridge {
            stop_tx: Some(stop_tx),
        }),
        Ok(Err(message)) => Err(SchedulerError::Signal(message)),
        Err(_) => Err(SchedulerError::Signal("signal thread exited early".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signals_escalate() {
        assert_eq!(escalate(1), Some(ControlEvent::Stop));
        assert_eq!(escalate(2), Some(ControlEvent::Terminate));
        assert_eq!(escalate(3), None);
        assert_eq!(escalate(7), None);
    }
}
