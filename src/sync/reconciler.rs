//! Message Stream Reconciler
//!
//! Merges the snapshot sent on every (re)connection with the incremental messages that
//! follow it into one ordered view. Order is delivery order: snapshot order first, then
//! arrival order. Timestamps are never used to re-sort.
//!
//! Every write into the [`RenderSink`] is an upsert keyed by message id, so a message
//! delivered twice on the same connection still yields exactly one visible entry.

use log::{debug, info};
use std::collections::{HashMap, HashSet};

use crate::models::{Message, Origin};
use crate::sync::identity::OriginClassifier;
use crate::sync::StreamEvent;

/// A message plus its presentation classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub message: Message,
    pub origin: Origin,
}

/// Consumer of the reconciled view (terminal UI, in-memory log, test recorder).
pub trait RenderSink {
    /// Drop every visible entry.
    fn clear(&mut self);

    /// Insert a new entry at the end, or replace the entry with the same id in place.
    fn upsert(&mut self, entry: RenderedMessage);
}

/// What an apply call did to the visible log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Snapshot replaced the whole log with this many entries
    Replaced(usize),
    Inserted,
    /// An entry with the same id was already visible and was replaced in place
    Updated,
    Ignored,
}

pub struct Reconciler {
    classifier: Box<dyn OriginClassifier + Send + Sync>,
    visible: HashSet<String>,
}

impl Reconciler {
    pub fn new<C>(classifier: C) -> Self
    where
        C: OriginClassifier + Send + Sync + 'static,
    {
        Self {
            classifier: Box::new(classifier),
            visible: HashSet::new(),
        }
    }

    /// Number of distinct ids currently visible.
    pub fn visible_count(&self) -> usize {
        self.visible.len()
    }

    pub fn apply(&mut self, sink: &mut dyn RenderSink, event: StreamEvent) -> Applied {
        match event {
            StreamEvent::InitialState { messages } => self.apply_snapshot(sink, messages),
            StreamEvent::NewMessage { message } => self.apply_incremental(sink, message),
            StreamEvent::Unknown => Applied::Ignored,
        }
    }

    /// Replace the visible log with `messages`, in the given order.
    pub fn apply_snapshot(&mut self, sink: &mut dyn RenderSink, messages: Vec<Message>) -> Applied {
        sink.clear();
        self.visible.clear();

        for message in messages {
            self.render(sink, message);
        }

        info!("Applied snapshot with {} messages", self.visible.len());
        Applied::Replaced(self.visible.len())
    }

    /// Append one message in arrival order, or replace it if its id is already visible.
    pub fn apply_incremental(&mut self, sink: &mut dyn RenderSink, message: Message) -> Applied {
        let id = message.id.clone();
        let applied = self.render(sink, message);
        if applied == Applied::Updated {
            debug!("Message {} delivered again, replaced in place", id);
        }
        applied
    }

    fn render(&mut self, sink: &mut dyn RenderSink, message: Message) -> Applied {
        let origin = self.classifier.classify(&message);
        let applied = if self.visible.insert(message.id.clone()) {
            Applied::Inserted
        } else {
            Applied::Updated
        };
        sink.upsert(RenderedMessage { message, origin });
        applied
    }
}

/// Ordered, id-keyed in-memory view. Used as the terminal UI's backing store and
/// anywhere a headless sink is needed.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    entries: Vec<RenderedMessage>,
    index: HashMap<String, usize>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RenderedMessage] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&RenderedMessage> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Entry by its 1-based display position.
    pub fn by_position(&self, position: usize) -> Option<&RenderedMessage> {
        position.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// Visible contents in order.
    pub fn contents(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.message.content.as_str()).collect()
    }
}

impl RenderSink for MessageLog {
    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    fn upsert(&mut self, entry: RenderedMessage) {
        match self.index.get(&entry.message.id) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(entry.message.id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }
}
