//! Background worker thread hosting the connection actor
//!
//! Spawns a thread with its own single-threaded tokio runtime. The runtime
//! drives the mailbox and the connect timers; the state machine itself is
//! plain synchronous code invoked once per message.

use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};

use a2dp_stack::LowerStackGateway;
use parking_lot::RwLock;

use crate::admission::AdmissionPolicy;
use crate::config::ManagerConfig;
use crate::error::{A2dpError, Result};
use crate::machine::ConnectionStateMachine;
use crate::message::{MailboxReceiver, MailboxSender};
use crate::notify::NotificationBroadcaster;
use crate::snapshot::ConnectionSnapshot;
use crate::timeout::TimeoutSupervisor;

/// Everything the worker needs to build its state machine
pub(crate) struct WorkerParts {
    pub config: ManagerConfig,
    pub policy: AdmissionPolicy,
    pub gateway: Arc<dyn LowerStackGateway>,
    pub notifier: Arc<NotificationBroadcaster>,
    pub snapshot: Arc<RwLock<ConnectionSnapshot>>,
    pub mailbox_tx: MailboxSender,
    pub mailbox_rx: MailboxReceiver,
}

/// Spawn the connection worker and wait until its runtime is up
pub(crate) fn spawn_connection_worker(parts: WorkerParts) -> Result<JoinHandle<()>> {
    let (ready_tx, ready_rx) = std_mpsc::sync_channel::<std::result::Result<(), String>>(1);

    let handle = thread::Builder::new()
        .name("a2dp-connection".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Failed to create tokio runtime for connection worker: {}", e);
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };

            let WorkerParts {
                config,
                policy,
                gateway,
                notifier,
                snapshot,
                mailbox_tx,
                mailbox_rx,
            } = parts;

            let timer = TimeoutSupervisor::new(rt.handle().clone(), mailbox_tx);
            let machine =
                ConnectionStateMachine::new(&config, policy, gateway, notifier.clone(), timer);
            let _ = ready_tx.send(Ok(()));

            rt.block_on(run_connection_loop(machine, mailbox_rx, notifier, snapshot));
        })
        .map_err(|e| A2dpError::WorkerSpawn(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(reason)) => Err(A2dpError::WorkerSpawn(reason)),
        Err(_) => Err(A2dpError::WorkerSpawn(
            "worker exited before becoming ready".to_string(),
        )),
    }
}

/// Main loop: one message at a time, snapshot published before the
/// step's notifications are released
async fn run_connection_loop(
    mut machine: ConnectionStateMachine<TimeoutSupervisor>,
    mut mailbox: MailboxReceiver,
    notifier: Arc<NotificationBroadcaster>,
    snapshot: Arc<RwLock<ConnectionSnapshot>>,
) {
    tracing::info!("Connection worker started");

    while let Some(message) = mailbox.recv().await {
        tracing::trace!("Worker: processing {:?}", message);
        notifier.begin_batch();
        machine.handle(message);
        *snapshot.write() = machine.snapshot();
        notifier.flush();

        if machine.is_stopped() {
            break;
        }
    }

    tracing::info!("Connection worker stopped");
}
