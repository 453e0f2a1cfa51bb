//! Ports: named, ordered, bidirectional message pipes between two contexts.
//!
//! A pipe has two ends. Messages posted on one end are delivered, in send
//! order, to every listener registered on the other end. Disconnecting either
//! end closes the pipe and notifies the listeners of the *other* end only.
//!
//! Listeners are scoped: dropping a [`PortListener`] unregisters it, so a
//! listener can never outlive the state that installed it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one port end
pub type PortId = u64;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("Attempting to use a disconnected port object")]
    Disconnected,

    #[error("Failed to serialize port message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Something a listener observes on its port end
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Message(Value),
    Disconnected,
}

struct Listeners {
    entries: Mutex<Vec<(u64, mpsc::UnboundedSender<PortEvent>)>>,
}

impl Listeners {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, mpsc::UnboundedSender<PortEvent>)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Link {
    open: AtomicBool,
    ends: [End; 2],
}

struct End {
    id: PortId,
    listeners: Listeners,
}

/// One end of a pipe. Cloning yields another handle to the same end.
#[derive(Clone)]
pub struct Port {
    name: Arc<str>,
    link: Arc<Link>,
    side: usize,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Port {
    /// Open a new pipe and return both ends.
    pub fn pair(name: impl Into<String>) -> (Port, Port) {
        let name: Arc<str> = Arc::from(name.into());
        let end = || End {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            listeners: Listeners::new(),
        };
        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            ends: [end(), end()],
        });
        (
            Port {
                name: name.clone(),
                link: link.clone(),
                side: 0,
            },
            Port {
                name,
                link,
                side: 1,
            },
        )
    }

    pub fn id(&self) -> PortId {
        self.link.ends[self.side].id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.link.open.load(Ordering::Acquire)
    }

    fn own(&self) -> &End {
        &self.link.ends[self.side]
    }

    fn peer(&self) -> &End {
        &self.link.ends[1 - self.side]
    }

    /// Deliver a message to every listener on the other end.
    pub fn post_message<T: Serialize>(&self, message: &T) -> Result<(), PortError> {
        let value = serde_json::to_value(message)?;
        self.post_value(value)
    }

    pub fn post_value(&self, value: Value) -> Result<(), PortError> {
        if !self.is_connected() {
            return Err(PortError::Disconnected);
        }
        let entries = self.peer().listeners.lock();
        for (_, tx) in entries.iter() {
            let _ = tx.send(PortEvent::Message(value.clone()));
        }
        Ok(())
    }

    /// Register a listener for events arriving on this end.
    ///
    /// Subscribing to an already-closed end yields a listener whose first
    /// event is `Disconnected`.
    pub fn subscribe(&self) -> PortListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.own().listeners.lock();
            if !self.is_connected() {
                let _ = tx.send(PortEvent::Disconnected);
            }
            entries.push((id, tx));
        }
        PortListener {
            id,
            rx,
            port: self.clone(),
        }
    }

    /// Close the pipe. The other end's listeners see `Disconnected`; calling
    /// this again is a no-op.
    pub fn disconnect(&self) {
        // Flip the flag under the peer lock so a concurrent subscribe on the
        // peer either sees the closed flag or receives the notification.
        let entries = self.peer().listeners.lock();
        if !self.link.open.swap(false, Ordering::AcqRel) {
            return;
        }
        for (_, tx) in entries.iter() {
            let _ = tx.send(PortEvent::Disconnected);
        }
    }

    /// Number of listeners registered on this end
    pub fn listener_count(&self) -> usize {
        self.own().listeners.lock().len()
    }

    fn unsubscribe(&self, listener_id: u64) {
        self.own()
            .listeners
            .lock()
            .retain(|(id, _)| *id != listener_id);
    }
}

/// A registered listener. Dropping it removes the registration.
pub struct PortListener {
    id: u64,
    rx: mpsc::UnboundedReceiver<PortEvent>,
    port: Port,
}

impl PortListener {
    /// Next event on this end. After `Disconnected` nothing further arrives.
    pub async fn recv(&mut self) -> PortEvent {
        match self.rx.recv().await {
            Some(event) => event,
            None => PortEvent::Disconnected,
        }
    }

    pub fn try_recv(&mut self) -> Option<PortEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for PortListener {
    fn drop(&mut self) {
        self.port.unsubscribe(self.id);
    }
}
