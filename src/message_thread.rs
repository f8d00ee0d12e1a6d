// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The dedicated message thread plugin SDKs require.
//!
//! Plugin creation, destruction, and certain SDK callbacks must run on one
//! well-known thread. Workers and the processor chain hold a cloneable
//! [`MessageThread`] handle; `call` executes a closure there synchronously,
//! `post` fires and forgets. The thread joins when the last handle drops.

use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the message thread, visible in debuggers and thread dumps.
pub const MESSAGE_THREAD_NAME: &str = "remoterack-message";

/// Error type for message-thread operations.
#[derive(Debug, Error)]
pub enum MessageThreadError {
    /// The OS refused to spawn the thread.
    #[error("failed to spawn message thread: {0}")]
    Spawn(String),

    /// The thread is gone; the call could not complete.
    #[error("message thread terminated")]
    Terminated,
}

type Task = Box<dyn FnOnce() + Send>;

/// Cloneable handle to the message thread.
#[derive(Clone)]
pub struct MessageThread {
    inner: Arc<Inner>,
}

struct Inner {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl MessageThread {
    /// Spawn the message thread.
    pub fn spawn() -> Result<Self, MessageThreadError> {
        let (tx, rx) = mpsc::channel::<Task>();
        let handle = thread::Builder::new()
            .name(MESSAGE_THREAD_NAME.to_string())
            .spawn(move || {
                debug!("Message thread running");
                while let Ok(task) = rx.recv() {
                    task();
                }
                debug!("Message thread exiting");
            })
            .map_err(|e| MessageThreadError::Spawn(e.to_string()))?;

        let thread_id = handle.thread().id();
        Ok(Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(tx)),
                thread_id,
                join: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Whether the calling thread is the message thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Run a closure on the message thread without waiting for it.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let sender = self.inner.sender.lock();
        match sender.as_ref() {
            Some(tx) => {
                if tx.send(Box::new(task)).is_err() {
                    warn!("Message thread is gone, dropping posted task");
                }
            }
            None => warn!("Message thread is shut down, dropping posted task"),
        }
    }

    /// Run a closure on the message thread and return its result.
    ///
    /// Executes inline when already called from the message thread, so
    /// nested calls cannot deadlock. Errors when the thread is gone.
    pub fn call<R: Send + 'static>(
        &self,
        task: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R, MessageThreadError> {
        if self.is_current() {
            return Ok(task());
        }

        let (tx, rx) = mpsc::channel();
        self.post(move || {
            // The receiver only disappears if the caller panicked.
            let _ = tx.send(task());
        });
        rx.recv().map_err(|_| MessageThreadError::Terminated)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        *self.sender.lock() = None;
        if thread::current().id() == self.thread_id {
            // Last handle dropped by a task on the thread itself; it will
            // exit once the closed channel drains.
            return;
        }
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }
}
