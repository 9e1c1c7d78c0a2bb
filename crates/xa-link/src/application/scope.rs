//! # Call Scope
//!
//! Explicit per-call-chain transaction state, passed by `&mut` down the
//! chain instead of living in thread-local storage.
//!
//! A scope carries at most one bound `TransactionContext`, a stack of
//! transaction frames opened by the adapter, named resource bindings and the
//! completion listeners registered against the owning frames. `suspend`
//! pushes a mark: frames below the last mark are suspended and invisible to
//! `state()`, `connection()` and listener registration until `resume`.

use crate::domain::{
    invariant_single_active_context, AdapterState, TransactionContext, TransactionId, XaError,
};
use crate::ipc::{extract, inject, RpcMetadata};
use crate::ports::{CompletionListener, LocalTxHandle, ResourceHandle};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

/// Named resources bound to a scope for the life of a transaction.
pub type ResourceBindings = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// What a frame owns.
pub(crate) enum FrameKind {
    /// Plain local transaction.
    Local {
        handle: LocalTxHandle,
        /// This frame bound a dormant context that must be cleared with it.
        installed_dormant: bool,
    },
    /// This scope started the global transaction.
    Initiator {
        transaction_id: TransactionId,
        handle: ResourceHandle,
        /// Dormant context replaced by the promotion, restored on completion.
        promoted_from: Option<TransactionContext>,
    },
    /// This scope works inside a global transaction started elsewhere.
    Participant {
        transaction_id: TransactionId,
        coordinator: String,
        /// Enlisted lazily on first use.
        handle: Option<ResourceHandle>,
        /// An inner joined frame rolled back.
        rollback_only: bool,
    },
    /// Non-owning frame inside an owning global frame of the same scope.
    Joined { transaction_id: TransactionId },
}

impl FrameKind {
    fn is_owning(&self) -> bool {
        !matches!(self, Self::Joined { .. })
    }

    fn state(&self) -> AdapterState {
        match self {
            Self::Local { .. } => AdapterState::LocalActive,
            Self::Initiator { .. } => AdapterState::GlobalInitiatorActive,
            Self::Participant { .. } | Self::Joined { .. } => AdapterState::GlobalParticipantActive,
        }
    }
}

/// One open transaction.
pub(crate) struct Frame {
    pub(crate) kind: FrameKind,
    pub(crate) listeners: Vec<Box<dyn CompletionListener>>,
    /// Binding keys released when the frame completes.
    pub(crate) bound_keys: Vec<String>,
}

impl Frame {
    pub(crate) fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            listeners: Vec::new(),
            bound_keys: Vec::new(),
        }
    }
}

/// Context and bindings moved out of a scope by `suspend`.
#[must_use = "suspended resources must be handed back to resume"]
pub struct SuspendedResources {
    pub(crate) context: Option<TransactionContext>,
    pub(crate) bindings: ResourceBindings,
    pub(crate) depth: usize,
}

impl SuspendedResources {
    /// Context that was bound when the scope was suspended.
    pub fn context(&self) -> Option<&TransactionContext> {
        self.context.as_ref()
    }
}

impl fmt::Debug for SuspendedResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendedResources")
            .field("context", &self.context)
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .field("depth", &self.depth)
            .finish()
    }
}

/// A refused `resume`. The suspended resources come back untouched so the
/// caller can resume again once the scope is in order.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ResumeError {
    /// Why the scope refused the resources.
    pub error: XaError,
    /// What was handed to `resume`.
    pub suspended: SuspendedResources,
}

impl From<ResumeError> for XaError {
    fn from(e: ResumeError) -> Self {
        e.error
    }
}

/// Transaction state of one call chain.
pub struct CallScope {
    local_address: String,
    context: Option<TransactionContext>,
    frames: Vec<Frame>,
    bindings: ResourceBindings,
    marks: Vec<usize>,
}

impl CallScope {
    /// Empty scope for a call chain starting at this node.
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            context: None,
            frames: Vec::new(),
            bindings: HashMap::new(),
            marks: Vec::new(),
        }
    }

    /// Scope for an inbound RPC call, binding the propagated participant
    /// context if the caller sent one.
    pub fn inbound(local_address: impl Into<String>, metadata: &RpcMetadata) -> Result<Self, XaError> {
        let mut scope = Self::new(local_address);
        if let Some(context) = extract(metadata)? {
            trace!(tid = %context.transaction_id, coordinator = %context.coordinator_address,
                "Bound propagated context");
            scope.context = Some(context);
        }
        Ok(scope)
    }

    /// Address of the node this scope runs on.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Bound context, if any.
    pub fn context(&self) -> Option<&TransactionContext> {
        self.context.as_ref()
    }

    /// Adapter state of the innermost visible frame.
    pub fn state(&self) -> AdapterState {
        self.visible()
            .last()
            .map(|frame| frame.kind.state())
            .unwrap_or_default()
    }

    /// Whether a transaction is open and not suspended.
    pub fn has_transaction(&self) -> bool {
        !self.visible().is_empty()
    }

    /// Number of open frames, suspended ones included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Metadata to attach to an outbound RPC call.
    pub fn outbound_metadata(&self) -> Option<RpcMetadata> {
        self.context.as_ref().and_then(inject)
    }

    /// Register a listener on the nearest owning frame.
    pub fn register_listener(&mut self, listener: Box<dyn CompletionListener>) -> Result<(), XaError> {
        let index = self.owning_index().ok_or_else(|| {
            XaError::IllegalTransactionState("no transaction to register a listener with".into())
        })?;
        self.frames[index].listeners.push(listener);
        Ok(())
    }

    /// Bind a named resource to the current transaction. It is released when
    /// the owning frame completes.
    pub fn bind_resource(
        &mut self,
        key: impl Into<String>,
        resource: Arc<dyn Any + Send + Sync>,
    ) -> Result<(), XaError> {
        let key = key.into();
        let index = self.owning_index().ok_or_else(|| {
            XaError::IllegalTransactionState(format!("no transaction to bind {} to", key))
        })?;
        if self.bindings.contains_key(&key) {
            return Err(XaError::IllegalTransactionState(format!(
                "resource {} already bound",
                key
            )));
        }
        self.bindings.insert(key.clone(), resource);
        self.frames[index].bound_keys.push(key);
        Ok(())
    }

    /// Resource bound under `key`.
    pub fn resource(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.bindings.get(key).cloned()
    }

    /// Release a binding early.
    pub fn unbind_resource(&mut self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        for frame in &mut self.frames {
            frame.bound_keys.retain(|k| k != key);
        }
        self.bindings.remove(key)
    }

    // =========================================================================
    // Adapter-facing operations
    // =========================================================================

    pub(crate) fn bind_context(&mut self, context: TransactionContext) -> Result<(), XaError> {
        invariant_single_active_context(self.context.as_ref())?;
        self.context = Some(context);
        Ok(())
    }

    pub(crate) fn take_context(&mut self) -> Option<TransactionContext> {
        self.context.take()
    }

    pub(crate) fn restore_context(&mut self, context: Option<TransactionContext>) {
        self.context = context;
    }

    pub(crate) fn push_frame(&mut self, kind: FrameKind) -> usize {
        self.frames.push(Frame::new(kind));
        self.frames.len() - 1
    }

    /// Pop the top frame if it is the one at `depth`.
    pub(crate) fn pop_frame(&mut self, depth: usize) -> Result<Frame, XaError> {
        let floor = self.marks.last().copied().unwrap_or(0);
        if depth < floor {
            return Err(XaError::IllegalTransactionState(
                "transaction is suspended".into(),
            ));
        }
        if depth + 1 != self.frames.len() {
            return Err(XaError::IllegalTransactionState(format!(
                "transaction at depth {} completed out of order ({} open)",
                depth,
                self.frames.len()
            )));
        }
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| XaError::IllegalTransactionState("no open transaction".into()))?;
        for key in &frame.bound_keys {
            self.bindings.remove(key);
        }
        Ok(frame)
    }

    pub(crate) fn has_initiator_frame(&self) -> bool {
        self.frames
            .iter()
            .any(|frame| matches!(frame.kind, FrameKind::Initiator { .. }))
    }

    /// Nearest visible frame that owns a global transaction.
    pub(crate) fn owning_global_index(&self) -> Option<usize> {
        let floor = self.floor();
        (floor..self.frames.len()).rev().find(|&i| {
            matches!(
                self.frames[i].kind,
                FrameKind::Initiator { .. } | FrameKind::Participant { .. }
            )
        })
    }

    pub(crate) fn owning_index(&self) -> Option<usize> {
        let floor = self.floor();
        (floor..self.frames.len())
            .rev()
            .find(|&i| self.frames[i].kind.is_owning())
    }

    pub(crate) fn top_index(&self) -> Option<usize> {
        if self.has_transaction() {
            Some(self.frames.len() - 1)
        } else {
            None
        }
    }

    pub(crate) fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub(crate) fn frame_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.frames.get_mut(index)
    }

    pub(crate) fn suspend(&mut self) -> SuspendedResources {
        let floor = self.floor();
        for frame in &mut self.frames[floor..] {
            for listener in &mut frame.listeners {
                listener.on_suspend();
            }
        }
        self.marks.push(self.frames.len());
        SuspendedResources {
            context: self.context.take(),
            bindings: std::mem::take(&mut self.bindings),
            depth: self.frames.len(),
        }
    }

    pub(crate) fn resume(&mut self, suspended: SuspendedResources) -> Result<(), ResumeError> {
        if let Err(error) = self.check_resume(&suspended) {
            return Err(ResumeError { error, suspended });
        }

        self.marks.pop();
        self.context = suspended.context;
        self.bindings = suspended.bindings;
        let floor = self.floor();
        for frame in &mut self.frames[floor..] {
            for listener in &mut frame.listeners {
                listener.on_resume();
            }
        }
        Ok(())
    }

    fn check_resume(&self, suspended: &SuspendedResources) -> Result<(), XaError> {
        if self.marks.last() != Some(&suspended.depth) {
            return Err(XaError::IllegalTransactionState(
                "resources were not suspended from this scope level".into(),
            ));
        }
        if self.frames.len() > suspended.depth {
            return Err(XaError::IllegalTransactionState(format!(
                "{} transaction(s) opened after suspend are still open",
                self.frames.len() - suspended.depth
            )));
        }
        invariant_single_active_context(self.context.as_ref())
    }

    fn floor(&self) -> usize {
        self.marks.last().copied().unwrap_or(0)
    }

    fn visible(&self) -> &[Frame] {
        &self.frames[self.floor()..]
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if !self.frames.is_empty() {
            warn!(
                node = %self.local_address,
                open = self.frames.len(),
                "Call scope dropped with open transactions"
            );
        }
    }
}

impl std::fmt::Debug for CallScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallScope")
            .field("local_address", &self.local_address)
            .field("context", &self.context)
            .field("frames", &self.frames.len())
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .field("suspended_levels", &self.marks.len())
            .finish()
    }
}
