//! # Local Transaction Adapter
//!
//! Decides, per `begin`, whether the call drives a global transaction (as
//! initiator or participant) or a plain local one, and completes the frame
//! it opened.
//!
//! ## Frames
//!
//! | Frame | Opened when | Commit | Rollback |
//! |-------|-------------|--------|----------|
//! | Local | no active global context | `commit_local` | `rollback_local` |
//! | Initiator | distributed write with no context | transaction manager 2PC | transaction manager rollback |
//! | Participant | propagated context, no owning frame | end branch, defer listeners | end branch failed |
//! | Joined | inside an owning global frame | no-op | rollback-only |

use super::scope::{CallScope, FrameKind, ResumeError, SuspendedResources};
use crate::adapters::SynchronizationResource;
use crate::algorithms::{decide_begin, BeginDecision};
use crate::config::XaConfig;
use crate::domain::{
    AdapterState, CompletionOutcome, HeuristicState, TransactionContext, TransactionDefinition,
    TransactionId, TransactionManagerError, TransactionStatus, XaError,
};
use crate::ports::{
    BranchRegistry, CompletionListener, EnlistmentService, ResourceDriver, ResourceHandle,
    TimeSource, TransactionManager, XaResource,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Frame opened by `begin`, handed back to `commit` or `rollback`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionHandle {
    depth: usize,
    state: AdapterState,
    transaction_id: Option<TransactionId>,
    is_new: bool,
}

impl TransactionHandle {
    /// Adapter state of the frame.
    pub fn state(&self) -> AdapterState {
        self.state
    }

    /// Global transaction id, for global frames.
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction_id.as_ref()
    }

    /// Whether this frame owns its transaction or branch.
    ///
    /// True for initiator, participant and local frames. False only for a
    /// frame that joined an owning frame already open on the same scope;
    /// completing it just flags rollback-only or does nothing.
    pub fn is_new(&self) -> bool {
        self.is_new
    }
}

/// Per-node adapter between application code and the transaction machinery.
pub struct LocalTransactionAdapter {
    local_address: String,
    timeout_grace: Duration,
    driver: Arc<dyn ResourceDriver>,
    manager: Arc<dyn TransactionManager>,
    service: Arc<dyn EnlistmentService>,
    registry: Arc<dyn BranchRegistry>,
    time: Arc<dyn TimeSource>,
}

impl LocalTransactionAdapter {
    /// Wire an adapter for one resource.
    pub fn new(
        config: &XaConfig,
        driver: Arc<dyn ResourceDriver>,
        manager: Arc<dyn TransactionManager>,
        service: Arc<dyn EnlistmentService>,
        registry: Arc<dyn BranchRegistry>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            local_address: config.local_address.clone(),
            timeout_grace: Duration::from_millis(config.timeout_grace_ms),
            driver,
            manager,
            service,
            registry,
            time,
        }
    }

    /// Name of the resource this adapter drives.
    pub fn resource_name(&self) -> &str {
        self.driver.resource_name()
    }

    /// Open a transaction frame according to the propagation rules.
    pub async fn begin(
        &self,
        scope: &mut CallScope,
        definition: &TransactionDefinition,
    ) -> Result<TransactionHandle, XaError> {
        let decision = decide_begin(scope.context(), definition)?;
        debug!(node = %self.local_address, ?decision, propagation = ?definition.propagation,
            read_only = definition.read_only, "Begin");

        match decision {
            BeginDecision::Initiate | BeginDecision::Promote => {
                self.begin_initiator(scope, definition, decision == BeginDecision::Promote)
                    .await
            }
            BeginDecision::Join => self.begin_join(scope),
            BeginDecision::Local { dormant } => self.begin_local(scope, dormant).await,
        }
    }

    async fn begin_initiator(
        &self,
        scope: &mut CallScope,
        definition: &TransactionDefinition,
        promote: bool,
    ) -> Result<TransactionHandle, XaError> {
        if scope.has_initiator_frame() {
            return Err(XaError::CannotCreateTransaction(
                "a global transaction already exists for this call scope".into(),
            ));
        }

        let promoted_from = if promote { scope.take_context() } else { None };
        let composite = match self.manager.begin(definition.timeout).await {
            Ok(composite) => composite,
            Err(e) => {
                scope.restore_context(promoted_from);
                return Err(XaError::CannotCreateTransaction(format!(
                    "transaction manager refused begin: {}",
                    e
                )));
            }
        };
        let tid = composite.transaction_id;

        let handle = match self.enlist_own_branch(&tid).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(tid = %tid, error = %e, "Initiator branch enlistment failed");
                if let Err(rollback) = self.manager.rollback(&tid).await {
                    debug!(tid = %tid, error = %rollback, "Rollback after failed begin");
                }
                scope.restore_context(promoted_from);
                return Err(e);
            }
        };

        let timeout_at = self.time.now()
            + composite.timeout.as_millis() as u64
            + self.timeout_grace.as_millis() as u64;
        scope.bind_context(TransactionContext::initiator(
            tid.clone(),
            self.local_address.clone(),
            timeout_at,
        ))?;
        let depth = scope.push_frame(FrameKind::Initiator {
            transaction_id: tid.clone(),
            handle,
            promoted_from,
        });

        info!(tid = %tid, node = %self.local_address, promoted = promote, "Initiated global transaction");
        Ok(TransactionHandle {
            depth,
            state: AdapterState::GlobalInitiatorActive,
            transaction_id: Some(tid),
            is_new: true,
        })
    }

    async fn enlist_own_branch(&self, tid: &TransactionId) -> Result<ResourceHandle, XaError> {
        let session = self.driver.create_xa_session().await?;
        let branch = self
            .service
            .enlist_resource(
                &self.local_address,
                tid,
                &self.local_address,
                self.driver.resource_name(),
            )
            .await?;
        session.start(&branch).await?;
        self.registry
            .register_local_branch(branch.clone(), session.clone());
        Ok(ResourceHandle::Xa { branch, session })
    }

    fn begin_join(&self, scope: &mut CallScope) -> Result<TransactionHandle, XaError> {
        let context = scope.context().cloned().ok_or_else(|| {
            XaError::IllegalTransactionState("join requested without a bound context".into())
        })?;
        let tid = context.transaction_id.clone();

        if scope.owning_global_index().is_some() {
            let depth = scope.push_frame(FrameKind::Joined {
                transaction_id: tid.clone(),
            });
            debug!(tid = %tid, depth, "Joined enclosing transaction");
            return Ok(TransactionHandle {
                depth,
                state: AdapterState::GlobalParticipantActive,
                transaction_id: Some(tid),
                is_new: false,
            });
        }

        if context.is_expired(self.time.now()) {
            return Err(XaError::System(format!("transaction {} has timed out", tid)));
        }
        let depth = scope.push_frame(FrameKind::Participant {
            transaction_id: tid.clone(),
            coordinator: context.coordinator_address.clone(),
            handle: None,
            rollback_only: false,
        });
        info!(tid = %tid, coordinator = %context.coordinator_address, node = %self.local_address,
            "Participating in global transaction");
        Ok(TransactionHandle {
            depth,
            state: AdapterState::GlobalParticipantActive,
            transaction_id: Some(tid),
            is_new: true,
        })
    }

    async fn begin_local(
        &self,
        scope: &mut CallScope,
        dormant: bool,
    ) -> Result<TransactionHandle, XaError> {
        // a suspended initiator still owns the scope's connection
        if scope.has_initiator_frame() {
            return Err(XaError::CannotCreateTransaction(
                "a global transaction already exists for this call scope".into(),
            ));
        }
        let handle = self.driver.begin_local().await?;
        let installed_dormant = dormant && scope.context().is_none();
        if installed_dormant {
            scope.bind_context(TransactionContext::dormant(self.local_address.clone()))?;
        }
        let depth = scope.push_frame(FrameKind::Local {
            handle,
            installed_dormant,
        });
        debug!(depth, installed_dormant, "Local transaction begun");
        Ok(TransactionHandle {
            depth,
            state: AdapterState::LocalActive,
            transaction_id: None,
            is_new: true,
        })
    }

    /// Resource handle for the innermost visible transaction.
    ///
    /// A participant's branch is enlisted with the coordinator on first use.
    pub async fn connection(&self, scope: &mut CallScope) -> Result<ResourceHandle, XaError> {
        let top = scope
            .top_index()
            .ok_or_else(|| XaError::IllegalTransactionState("no active transaction".into()))?;
        let joined = matches!(
            scope.frame(top).map(|f| &f.kind),
            Some(FrameKind::Joined { .. })
        );
        let index = if joined {
            scope.owning_global_index().ok_or_else(|| {
                XaError::IllegalTransactionState("joined transaction lost its owner".into())
            })?
        } else {
            top
        };
        let frame = scope
            .frame_mut(index)
            .ok_or_else(|| XaError::IllegalTransactionState("no active transaction".into()))?;

        match &mut frame.kind {
            FrameKind::Local { handle, .. } => Ok(ResourceHandle::Local(*handle)),
            FrameKind::Initiator { handle, .. } => Ok(handle.clone()),
            FrameKind::Participant {
                handle: Some(handle),
                ..
            } => Ok(handle.clone()),
            FrameKind::Participant {
                transaction_id,
                coordinator,
                handle,
                ..
            } => {
                let session = self.driver.create_xa_session().await?;
                let enlisted = self
                    .enlist_participant(transaction_id, coordinator, session)
                    .await?;
                *handle = Some(enlisted.clone());
                Ok(enlisted)
            }
            FrameKind::Joined { .. } => Err(XaError::IllegalTransactionState(
                "joined frame has no resource of its own".into(),
            )),
        }
    }

    async fn enlist_participant(
        &self,
        tid: &TransactionId,
        coordinator: &str,
        session: Arc<dyn XaResource>,
    ) -> Result<ResourceHandle, XaError> {
        let branch = self
            .service
            .enlist_resource(coordinator, tid, &self.local_address, session.resource_name())
            .await?;
        session.start(&branch).await?;
        self.registry
            .register_local_branch(branch.clone(), session.clone());
        debug!(branch = %branch, coordinator, resource = session.resource_name(),
            "Participant branch enlisted");
        Ok(ResourceHandle::Xa { branch, session })
    }

    /// Commit the frame opened by `handle`. Frames complete in LIFO order.
    pub async fn commit(
        &self,
        scope: &mut CallScope,
        handle: TransactionHandle,
    ) -> Result<(), XaError> {
        let frame = scope.pop_frame(handle.depth)?;
        let mut listeners = frame.listeners;

        let result = match frame.kind {
            FrameKind::Local {
                handle,
                installed_dormant,
            } => {
                if installed_dormant {
                    scope.restore_context(None);
                }
                self.driver.commit_local(handle).await
            }
            FrameKind::Initiator {
                transaction_id,
                handle,
                promoted_from,
            } => {
                let result = self.commit_initiator(&transaction_id, &handle).await;
                scope.restore_context(promoted_from);
                match &result {
                    Ok(()) => info!(tid = %transaction_id, "Global transaction committed"),
                    Err(e) => warn!(tid = %transaction_id, error = %e, "Global commit failed"),
                }
                result
            }
            FrameKind::Participant {
                transaction_id,
                coordinator,
                handle,
                rollback_only,
            } => {
                self.complete_participant(
                    &transaction_id,
                    &coordinator,
                    handle,
                    !rollback_only,
                    std::mem::take(&mut listeners),
                )
                .await
                .and_then(|_| {
                    if rollback_only {
                        Err(XaError::UnexpectedRollback(format!(
                            "participant work in {} was marked rollback-only",
                            transaction_id
                        )))
                    } else {
                        Ok(())
                    }
                })
            }
            FrameKind::Joined { .. } => Ok(()),
        };

        let outcome = match &result {
            Ok(()) => CompletionOutcome::Committed,
            Err(XaError::UnexpectedRollback(_)) => CompletionOutcome::RolledBack,
            Err(_) => CompletionOutcome::Unknown,
        };
        notify(listeners, outcome).await;
        result
    }

    async fn commit_initiator(
        &self,
        tid: &TransactionId,
        handle: &ResourceHandle,
    ) -> Result<(), XaError> {
        if let ResourceHandle::Xa { branch, session } = handle {
            if let Err(e) = session.end(branch, true).await {
                warn!(branch = %branch, error = %e, "Ending initiator branch failed");
                if let Err(mark) = self.manager.set_rollback_only(tid).await {
                    debug!(tid = %tid, error = %mark, "Could not mark rollback-only");
                }
            }
        }

        let status = self.manager.status(tid).await.map_err(commit_error)?;
        match status {
            TransactionStatus::NoTransaction => Err(XaError::UnexpectedRollback(format!(
                "transaction {} already completed",
                tid
            ))),
            TransactionStatus::RolledBack => {
                match self.manager.rollback(tid).await {
                    Ok(()) | Err(TransactionManagerError::IllegalState(_)) => {}
                    Err(e) => return Err(commit_error(e)),
                }
                Err(XaError::UnexpectedRollback(format!(
                    "transaction {} already rolled back (probably due to a timeout)",
                    tid
                )))
            }
            TransactionStatus::MarkedRollback
                if !self.manager.should_commit_on_global_rollback_only() =>
            {
                self.manager.rollback(tid).await.map_err(commit_error)?;
                Err(XaError::UnexpectedRollback(format!(
                    "transaction {} was marked rollback-only",
                    tid
                )))
            }
            _ => self.manager.commit(tid).await.map_err(commit_error),
        }
    }

    /// End a participant's branch and hand its listeners to the registry.
    ///
    /// A participant that never touched the resource but has listeners
    /// enlists a synchronization branch so it still hears the outcome.
    async fn complete_participant(
        &self,
        tid: &TransactionId,
        coordinator: &str,
        handle: Option<ResourceHandle>,
        success: bool,
        listeners: Vec<Box<dyn CompletionListener>>,
    ) -> Result<(), XaError> {
        let handle = match handle {
            Some(handle) => Some(handle),
            None if !listeners.is_empty() || !success => {
                let session: Arc<dyn XaResource> = Arc::new(SynchronizationResource::new());
                match self.enlist_participant(tid, coordinator, session).await {
                    Ok(handle) => Some(handle),
                    Err(XaError::RollbackAlreadyRequested(_)) if !success => {
                        debug!(tid = %tid, "Transaction already doomed");
                        notify(listeners, CompletionOutcome::RolledBack).await;
                        return Ok(());
                    }
                    Err(e) => {
                        let outcome = match e {
                            XaError::RollbackAlreadyRequested(_) => CompletionOutcome::RolledBack,
                            _ => CompletionOutcome::Unknown,
                        };
                        warn!(tid = %tid, error = %e, "Synchronization branch enlistment failed");
                        notify(listeners, outcome).await;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let Some(ResourceHandle::Xa { branch, session }) = handle else {
            return Ok(());
        };
        let ended = session.end(&branch, success).await;
        self.registry.defer_completion(&branch, listeners);
        debug!(branch = %branch, success, "Participant branch ended");
        ended
    }

    /// Roll back the frame opened by `handle`.
    pub async fn rollback(
        &self,
        scope: &mut CallScope,
        handle: TransactionHandle,
    ) -> Result<(), XaError> {
        let frame = scope.pop_frame(handle.depth)?;
        let mut listeners = frame.listeners;

        let result = match frame.kind {
            FrameKind::Local {
                handle,
                installed_dormant,
            } => {
                if installed_dormant {
                    scope.restore_context(None);
                }
                self.driver.rollback_local(handle).await
            }
            FrameKind::Initiator {
                transaction_id,
                handle,
                promoted_from,
            } => {
                let result = self.rollback_initiator(&transaction_id, &handle).await;
                scope.restore_context(promoted_from);
                info!(tid = %transaction_id, "Global transaction rolled back");
                result
            }
            FrameKind::Participant {
                transaction_id,
                coordinator,
                handle,
                ..
            } => {
                self.complete_participant(
                    &transaction_id,
                    &coordinator,
                    handle,
                    false,
                    std::mem::take(&mut listeners),
                )
                .await
            }
            FrameKind::Joined { transaction_id } => {
                self.mark_owner_rollback_only(scope, &transaction_id).await
            }
        };

        let outcome = if result.is_ok() {
            CompletionOutcome::RolledBack
        } else {
            CompletionOutcome::Unknown
        };
        notify(listeners, outcome).await;
        result
    }

    async fn rollback_initiator(
        &self,
        tid: &TransactionId,
        handle: &ResourceHandle,
    ) -> Result<(), XaError> {
        if let ResourceHandle::Xa { branch, session } = handle {
            if let Err(e) = session.end(branch, false).await {
                debug!(branch = %branch, error = %e, "Ending initiator branch failed");
            }
        }

        let status = self.manager.status(tid).await.map_err(rollback_error)?;
        if status == TransactionStatus::NoTransaction {
            debug!(tid = %tid, "Nothing to roll back");
            return Ok(());
        }
        match self.manager.rollback(tid).await {
            Ok(()) => Ok(()),
            Err(TransactionManagerError::IllegalState(reason))
                if status == TransactionStatus::RolledBack =>
            {
                debug!(tid = %tid, reason, "Transaction already rolled back");
                Ok(())
            }
            Err(e) => Err(rollback_error(e)),
        }
    }

    async fn mark_owner_rollback_only(
        &self,
        scope: &mut CallScope,
        tid: &TransactionId,
    ) -> Result<(), XaError> {
        let owner = scope
            .owning_global_index()
            .and_then(|index| scope.frame_mut(index));
        match owner.map(|frame| &mut frame.kind) {
            Some(FrameKind::Participant { rollback_only, .. }) => {
                *rollback_only = true;
                debug!(tid = %tid, "Participant frame marked rollback-only");
                Ok(())
            }
            Some(FrameKind::Initiator { .. }) => self
                .manager
                .set_rollback_only(tid)
                .await
                .map_err(rollback_error),
            _ => Err(XaError::IllegalTransactionState(format!(
                "no owning frame for joined transaction {}",
                tid
            ))),
        }
    }

    /// Move the bound context and resource bindings out of the scope.
    pub fn suspend(&self, scope: &mut CallScope) -> SuspendedResources {
        let suspended = scope.suspend();
        if let Some(context) = suspended.context() {
            debug!(tid = %context.transaction_id, "Suspended transaction");
        }
        suspended
    }

    /// Restore what `suspend` moved out.
    ///
    /// On refusal the resources are handed back inside the error.
    pub fn resume(
        &self,
        scope: &mut CallScope,
        suspended: SuspendedResources,
    ) -> Result<(), ResumeError> {
        scope.resume(suspended)?;
        if let Some(context) = scope.context() {
            debug!(tid = %context.transaction_id, "Resumed transaction");
        }
        Ok(())
    }
}

async fn notify(listeners: Vec<Box<dyn CompletionListener>>, outcome: CompletionOutcome) {
    for listener in listeners {
        listener.after_completion(outcome).await;
    }
}

fn commit_error(e: TransactionManagerError) -> XaError {
    match e {
        TransactionManagerError::RolledBack(reason) => XaError::UnexpectedRollback(reason),
        TransactionManagerError::NoTransaction => {
            XaError::UnexpectedRollback("transaction already completed".into())
        }
        TransactionManagerError::HeuristicMixed(reason) => XaError::HeuristicCompletion {
            state: HeuristicState::Mixed,
            reason,
        },
        TransactionManagerError::HeuristicRollback(reason) => XaError::HeuristicCompletion {
            state: HeuristicState::RolledBack,
            reason,
        },
        TransactionManagerError::IllegalState(reason) => {
            error!(reason, "Transaction manager reported an illegal state");
            XaError::TransactionSystem("unexpected internal transaction state".into())
        }
        TransactionManagerError::NotSupported(reason) | TransactionManagerError::System(reason) => {
            XaError::TransactionSystem(format!("failure on commit: {}", reason))
        }
    }
}

fn rollback_error(e: TransactionManagerError) -> XaError {
    match e {
        TransactionManagerError::IllegalState(reason) => {
            error!(reason, "Transaction manager reported an illegal state");
            XaError::TransactionSystem("unexpected internal transaction state".into())
        }
        other => XaError::TransactionSystem(format!("failure on rollback: {}", other)),
    }
}
