//! Sending side of an isolate thread's command queue.

use crate::runtime::error::BridgeError;
use crate::runtime::runner::IsolateCommand;
use std::sync::mpsc;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;

/// Reply channel for a single command, blocking or async.
pub(crate) enum Responder<T> {
    Sync(mpsc::Sender<Result<T, BridgeError>>),
    Async(oneshot::Sender<Result<T, BridgeError>>),
}

impl<T> Responder<T> {
    pub(crate) fn send(self, result: Result<T, BridgeError>) {
        // The caller may have given up waiting; nothing to do then.
        match self {
            Responder::Sync(tx) => {
                let _ = tx.send(result);
            }
            Responder::Async(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

/// Cloneable handle feeding commands to one isolate thread, in FIFO order.
#[derive(Clone)]
pub(crate) struct CommandHandle {
    tx: async_mpsc::UnboundedSender<IsolateCommand>,
}

impl CommandHandle {
    pub(crate) fn new(tx: async_mpsc::UnboundedSender<IsolateCommand>) -> Self {
        Self { tx }
    }

    /// Queue a command without waiting for it to run.
    pub(crate) fn post(&self, command: IsolateCommand) -> Result<(), BridgeError> {
        self.tx
            .send(command)
            .map_err(|_| BridgeError::IsolateClosed)
    }

    /// Queue a command and block until the isolate thread answers.
    pub(crate) fn request<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> IsolateCommand,
    ) -> Result<T, BridgeError> {
        let (result_tx, result_rx) = mpsc::channel();
        self.post(build(Responder::Sync(result_tx)))?;
        result_rx.recv().map_err(|_| BridgeError::IsolateClosed)?
    }

    /// Queue a command and await the answer.
    pub(crate) async fn request_async<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> IsolateCommand,
    ) -> Result<T, BridgeError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.post(build(Responder::Async(result_tx)))?;
        result_rx.await.map_err(|_| BridgeError::IsolateClosed)?
    }
}
