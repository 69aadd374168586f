//! Extractor notifications.
//!
//! Events go to registered callbacks first, then to every live channel
//! subscriber. Emitting never happens with the session lock held.

use std::sync::Arc;

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractorEvent {
    /// Listing finished; carries the member names in archive order.
    ListingComplete { contents: Vec<String> },
    /// A requested member is fully written.
    FileReady {
        name: String,
        destination_name: String,
    },
}

pub type ListingCallback = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Receives `(name, destination_name)`.
pub type FileReadyCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
pub struct EventHub {
    listing_callbacks: Mutex<Vec<ListingCallback>>,
    file_callbacks: Mutex<Vec<FileReadyCallback>>,
    subscribers: Mutex<Vec<Sender<ExtractorEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_listing_complete<F>(&self, callback: F)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.listing_callbacks.lock().push(Arc::new(callback));
    }

    pub fn on_file_ready<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.file_callbacks.lock().push(Arc::new(callback));
    }

    /// New unbounded channel receiving every later event.
    pub fn subscribe(&self) -> Receiver<ExtractorEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: ExtractorEvent) {
        trace!(?event, "Emitting extractor event");
        match &event {
            ExtractorEvent::ListingComplete { contents } => {
                let callbacks = self.listing_callbacks.lock().clone();
                for callback in callbacks {
                    callback(contents.as_slice());
                }
            }
            ExtractorEvent::FileReady {
                name,
                destination_name,
            } => {
                let callbacks = self.file_callbacks.lock().clone();
                for callback in callbacks {
                    callback(name.as_str(), destination_name.as_str());
                }
            }
        }

        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
