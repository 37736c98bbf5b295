//! Collection wrappers for plural associations.

use crate::instance::{RecordHandle, SessionId};

/// The elements of one plural association of one managed instance.
///
/// Created when the owning instance is constructed and bound for its lifetime to that
/// instance and the session managing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedCollection {
    attribute: String,
    owner: RecordHandle,
    session: SessionId,
    elements: Vec<RecordHandle>,
}

impl ManagedCollection {
    pub(crate) fn new(attribute: impl Into<String>, owner: RecordHandle, session: SessionId) -> Self {
        Self {
            attribute: attribute.into(),
            owner,
            session,
            elements: Vec::new(),
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn owner(&self) -> RecordHandle {
        self.owner
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn elements(&self) -> &[RecordHandle] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, handle: RecordHandle) -> bool {
        self.elements.contains(&handle)
    }

    /// Add an element; duplicates are ignored.
    pub(crate) fn push(&mut self, handle: RecordHandle) {
        if !self.contains(handle) {
            self.elements.push(handle);
        }
    }

    pub(crate) fn remove(&mut self, handle: RecordHandle) {
        self.elements.retain(|h| *h != handle);
    }
}
