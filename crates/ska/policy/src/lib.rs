//! SKA Policy - Pluggable validation strategies
//!
//! A policy validates a session authorization plus its call batch against
//! policy-specific rules and answers with a [`Verdict`]. Validation never
//! mutates policy state; the post-execution hooks are the only mutating
//! surface, and the orchestrator treats them as advisory (a hook failure is
//! logged and discarded, never allowed to undo an executed batch).
//!
//! Every policy commits to its live rule set through a snapshot hash. A
//! signed authorization embeds the hash it was issued against; when the
//! rules change afterwards the snapshot no longer matches and the stale
//! credential is rejected with [`VerdictCode::SnapshotMismatch`].

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use ska_crypto::keccak256;
use ska_types::{
    Address, CallBatch, ChainId, Hash32, PolicyId, SessionAuthorization, Verdict, VerdictCode,
    MAX_SESSION_TTL_SECS,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::info;

/// Read-only view of the execution substrate's code space, used for
/// target-must-be-executable checks and code-identity pinning.
pub trait CodeInspector {
    /// Whether `target` is an executable entity rather than a bare identity.
    fn is_executable(&self, target: Address) -> bool;

    /// Content hash of the target's executable code, when it has any.
    fn code_hash(&self, target: Address) -> Option<Hash32>;
}

/// Inspector for environments with no executable targets at all.
pub struct NullInspector;

impl CodeInspector for NullInspector {
    fn is_executable(&self, _target: Address) -> bool {
        false
    }

    fn code_hash(&self, _target: Address) -> Option<Hash32> {
        None
    }
}

/// Ambient facts a policy validates against.
pub struct ValidationContext<'a> {
    pub chain_id: ChainId,
    pub now: DateTime<Utc>,
    pub code: &'a dyn CodeInspector,
}

/// A pluggable validation strategy.
pub trait Policy: Send + Sync {
    /// The id this policy is registered under.
    fn id(&self) -> PolicyId;

    /// Commitment over the current mutable rule set. Changes whenever the
    /// rules change; consumption state (spent budgets) is not part of it.
    fn snapshot_hash(&self) -> Result<Hash32, PolicyError>;

    /// Validate an authorization and its batch. Pure with respect to policy
    /// state. Must check at minimum the policy-id/snapshot binding, expiry,
    /// and domain match (see [`base_checks`]).
    fn validate(
        &self,
        auth: &SessionAuthorization,
        batch: &CallBatch,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, PolicyError>;

    /// Advisory success hook, invoked after the batch executed. This is the
    /// only place a policy may consume internal budget.
    fn on_executed(
        &self,
        _executor: Address,
        _auth: &SessionAuthorization,
        _batch: &CallBatch,
        _cost_used: u64,
    ) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Advisory failure hook. Never consumes budget.
    fn on_failed(
        &self,
        _executor: Address,
        _auth: &SessionAuthorization,
        _batch: &CallBatch,
        _reason: &str,
    ) -> Result<(), PolicyError> {
        Ok(())
    }
}

/// The checks every variant owes before its own rules: policy binding,
/// domain match, expiry window, and snapshot binding.
pub fn base_checks(
    policy_id: PolicyId,
    live_snapshot: Hash32,
    auth: &SessionAuthorization,
    ctx: &ValidationContext<'_>,
) -> Option<VerdictCode> {
    if auth.policy_id != policy_id {
        return Some(VerdictCode::PolicyNotFound);
    }
    if auth.chain_id != ctx.chain_id {
        return Some(VerdictCode::DomainMismatch);
    }
    let now = ctx.now.timestamp();
    if auth.expires_at <= now {
        return Some(VerdictCode::Expired);
    }
    if auth.expires_at - now > MAX_SESSION_TTL_SECS {
        return Some(VerdictCode::ExpiryTooLong);
    }
    if auth.snapshot_hash != live_snapshot {
        return Some(VerdictCode::SnapshotMismatch);
    }
    None
}

// ── Allow-list variant ──────────────────────────────────────────────

/// Every call target must appear in an admin-maintained set.
pub struct AllowListPolicy {
    id: PolicyId,
    targets: RwLock<BTreeSet<Address>>,
}

impl AllowListPolicy {
    pub fn new(id: PolicyId) -> Self {
        Self {
            id,
            targets: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn allow(&self, target: Address) -> Result<(), PolicyError> {
        let mut targets = self.targets.write().map_err(|_| PolicyError::LockError)?;
        targets.insert(target);
        info!(policy = %self.id, %target, "Allow-list target added");
        Ok(())
    }

    pub fn disallow(&self, target: Address) -> Result<(), PolicyError> {
        let mut targets = self.targets.write().map_err(|_| PolicyError::LockError)?;
        targets.remove(&target);
        info!(policy = %self.id, %target, "Allow-list target removed");
        Ok(())
    }
}

impl Policy for AllowListPolicy {
    fn id(&self) -> PolicyId {
        self.id
    }

    fn snapshot_hash(&self) -> Result<Hash32, PolicyError> {
        let targets = self.targets.read().map_err(|_| PolicyError::LockError)?;
        let mut buf = Vec::with_capacity(16 + targets.len() * 20);
        buf.extend_from_slice(b"ska.allowlist.v1");
        for target in targets.iter() {
            buf.extend_from_slice(&target.0);
        }
        Ok(keccak256(&buf))
    }

    fn validate(
        &self,
        auth: &SessionAuthorization,
        batch: &CallBatch,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, PolicyError> {
        if let Some(code) = base_checks(self.id, self.snapshot_hash()?, auth, ctx) {
            return Ok(Verdict::fail(code));
        }

        let targets = self.targets.read().map_err(|_| PolicyError::LockError)?;
        for call in batch.calls() {
            if !targets.contains(&call.target) {
                return Ok(Verdict::fail(VerdictCode::TargetNotAllowed));
            }
        }
        Ok(Verdict::pass())
    }
}

// ── Scoped allow-pairs variant ──────────────────────────────────────

/// Mutable rule set of the scoped variant.
#[derive(Clone, Debug, Default)]
struct ScopedRules {
    /// Escape mode: skip target/pair membership, keep every residual check.
    allow_all: bool,
    /// Per-call value ceiling.
    value_ceiling: u128,
    /// Whole-batch cost ceiling, over effective per-call cost ceilings.
    total_cost_ceiling: u64,
    /// Whole-target allowances, optionally pinned to a code hash.
    whole_targets: BTreeMap<Address, Option<Hash32>>,
    /// Per-(target, selector) allowances, optionally pinned to a code hash.
    pairs: BTreeMap<(Address, [u8; 4]), Option<Hash32>>,
}

/// Per-(target, action-selector) scoping with value and total-cost ceilings,
/// code-identity pinning, and a delegation guard on the principal.
///
/// Rejection codes: an unknown target yields `TargetNotAllowed`; a target
/// known only through pairs but called without a selector yields
/// `ActionNotAllowed`; a known target called with a selector no rule covers
/// yields `PairNotAllowed`. A pinned rule whose target code hash changed
/// since the rule was set rejects with `TargetNotAllowed`.
pub struct ScopedPolicy {
    id: PolicyId,
    rules: RwLock<ScopedRules>,
}

impl ScopedPolicy {
    pub fn new(id: PolicyId, value_ceiling: u128, total_cost_ceiling: u64) -> Self {
        Self {
            id,
            rules: RwLock::new(ScopedRules {
                allow_all: false,
                value_ceiling,
                total_cost_ceiling,
                whole_targets: BTreeMap::new(),
                pairs: BTreeMap::new(),
            }),
        }
    }

    pub fn set_allow_all(&self, allow_all: bool) -> Result<(), PolicyError> {
        let mut rules = self.rules.write().map_err(|_| PolicyError::LockError)?;
        rules.allow_all = allow_all;
        info!(policy = %self.id, allow_all, "Scoped policy mode changed");
        Ok(())
    }

    pub fn set_value_ceiling(&self, ceiling: u128) -> Result<(), PolicyError> {
        let mut rules = self.rules.write().map_err(|_| PolicyError::LockError)?;
        rules.value_ceiling = ceiling;
        Ok(())
    }

    pub fn set_total_cost_ceiling(&self, ceiling: u64) -> Result<(), PolicyError> {
        let mut rules = self.rules.write().map_err(|_| PolicyError::LockError)?;
        rules.total_cost_ceiling = ceiling;
        Ok(())
    }

    /// Allow every action on `target`, optionally pinned to its current code.
    pub fn allow_target(&self, target: Address, pin: Option<Hash32>) -> Result<(), PolicyError> {
        let mut rules = self.rules.write().map_err(|_| PolicyError::LockError)?;
        rules.whole_targets.insert(target, pin);
        info!(policy = %self.id, %target, pinned = pin.is_some(), "Scoped target allowed");
        Ok(())
    }

    /// Allow one (target, selector) pair, optionally pinned.
    pub fn allow_pair(
        &self,
        target: Address,
        selector: [u8; 4],
        pin: Option<Hash32>,
    ) -> Result<(), PolicyError> {
        let mut rules = self.rules.write().map_err(|_| PolicyError::LockError)?;
        rules.pairs.insert((target, selector), pin);
        info!(policy = %self.id, %target, "Scoped pair allowed");
        Ok(())
    }

    pub fn revoke_target(&self, target: Address) -> Result<(), PolicyError> {
        let mut rules = self.rules.write().map_err(|_| PolicyError::LockError)?;
        rules.whole_targets.remove(&target);
        rules.pairs.retain(|(t, _), _| *t != target);
        info!(policy = %self.id, %target, "Scoped target revoked");
        Ok(())
    }

    fn pin_holds(pin: Option<Hash32>, target: Address, ctx: &ValidationContext<'_>) -> bool {
        match pin {
            None => true,
            Some(expected) => ctx.code.code_hash(target) == Some(expected),
        }
    }
}

impl Policy for ScopedPolicy {
    fn id(&self) -> PolicyId {
        self.id
    }

    fn snapshot_hash(&self) -> Result<Hash32, PolicyError> {
        let rules = self.rules.read().map_err(|_| PolicyError::LockError)?;
        let mut buf = Vec::new();
        buf.extend_from_slice(b"ska.scoped.v1");
        buf.push(u8::from(rules.allow_all));
        buf.extend_from_slice(&rules.value_ceiling.to_be_bytes());
        buf.extend_from_slice(&rules.total_cost_ceiling.to_be_bytes());
        for (target, pin) in rules.whole_targets.iter() {
            buf.extend_from_slice(&target.0);
            buf.extend_from_slice(&pin.unwrap_or_default().0);
        }
        for ((target, selector), pin) in rules.pairs.iter() {
            buf.extend_from_slice(&target.0);
            buf.extend_from_slice(selector);
            buf.extend_from_slice(&pin.unwrap_or_default().0);
        }
        Ok(keccak256(&buf))
    }

    fn validate(
        &self,
        auth: &SessionAuthorization,
        batch: &CallBatch,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, PolicyError> {
        if let Some(code) = base_checks(self.id, self.snapshot_hash()?, auth, ctx) {
            return Ok(Verdict::fail(code));
        }

        // A principal that has redirected its own authority to executable
        // code cannot hold a scoped session.
        if ctx.code.is_executable(auth.principal) {
            return Ok(Verdict::fail(VerdictCode::DelegationNotAllowed));
        }

        let rules = self.rules.read().map_err(|_| PolicyError::LockError)?;

        let mut total_cost: u64 = 0;
        for call in batch.calls() {
            if call.value > rules.value_ceiling {
                return Ok(Verdict::fail(VerdictCode::ValueExceeded));
            }
            if !call.payload.is_empty() && !ctx.code.is_executable(call.target) {
                return Ok(Verdict::fail(VerdictCode::TargetNotExecutable));
            }

            if !rules.allow_all {
                if let Some(&pin) = rules.whole_targets.get(&call.target) {
                    if !Self::pin_holds(pin, call.target, ctx) {
                        return Ok(Verdict::fail(VerdictCode::TargetNotAllowed));
                    }
                } else {
                    let target_in_pairs =
                        rules.pairs.keys().any(|(target, _)| *target == call.target);
                    match call.selector() {
                        Some(selector) => match rules.pairs.get(&(call.target, selector)) {
                            Some(&pin) => {
                                if !Self::pin_holds(pin, call.target, ctx) {
                                    return Ok(Verdict::fail(VerdictCode::TargetNotAllowed));
                                }
                            }
                            None if target_in_pairs => {
                                return Ok(Verdict::fail(VerdictCode::PairNotAllowed));
                            }
                            None => {
                                return Ok(Verdict::fail(VerdictCode::TargetNotAllowed));
                            }
                        },
                        None if target_in_pairs => {
                            return Ok(Verdict::fail(VerdictCode::ActionNotAllowed));
                        }
                        None => {
                            return Ok(Verdict::fail(VerdictCode::TargetNotAllowed));
                        }
                    }
                }
            }

            total_cost =
                total_cost.saturating_add(call.effective_cost_ceiling(auth.call_cost_ceiling));
        }

        if total_cost > rules.total_cost_ceiling {
            return Ok(Verdict::fail(VerdictCode::TotalCostExceeded));
        }

        Ok(Verdict::pass())
    }
}

// ── Stateful budget-consuming variant ───────────────────────────────

/// How the budget variant prices an executed batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PricingMode {
    /// Proportional to the measured execution cost.
    Metered,
    /// Flat price per call regardless of measured cost.
    FixedPerCall(u64),
}

/// Always validates true; real enforcement happens in the success hook,
/// which debits the executor's internal budget. Failures never debit.
pub struct BudgetPolicy {
    id: PolicyId,
    mode: RwLock<PricingMode>,
    budgets: RwLock<HashMap<Address, u128>>,
}

impl BudgetPolicy {
    pub fn new(id: PolicyId, mode: PricingMode) -> Self {
        Self {
            id,
            mode: RwLock::new(mode),
            budgets: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_mode(&self, mode: PricingMode) -> Result<(), PolicyError> {
        let mut current = self.mode.write().map_err(|_| PolicyError::LockError)?;
        *current = mode;
        info!(policy = %self.id, ?mode, "Budget policy pricing mode changed");
        Ok(())
    }

    /// Top up an executor's internal budget.
    pub fn fund(&self, executor: Address, amount: u128) -> Result<(), PolicyError> {
        let mut budgets = self.budgets.write().map_err(|_| PolicyError::LockError)?;
        let entry = budgets.entry(executor).or_insert(0);
        *entry = entry.saturating_add(amount);
        Ok(())
    }

    pub fn budget_of(&self, executor: Address) -> Result<u128, PolicyError> {
        let budgets = self.budgets.read().map_err(|_| PolicyError::LockError)?;
        Ok(budgets.get(&executor).copied().unwrap_or(0))
    }
}

impl Policy for BudgetPolicy {
    fn id(&self) -> PolicyId {
        self.id
    }

    fn snapshot_hash(&self) -> Result<Hash32, PolicyError> {
        // The snapshot covers the rule set (pricing), not spent balances.
        let mode = self.mode.read().map_err(|_| PolicyError::LockError)?;
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(b"ska.budget.v1");
        match *mode {
            PricingMode::Metered => buf.push(0),
            PricingMode::FixedPerCall(price) => {
                buf.push(1);
                buf.extend_from_slice(&price.to_be_bytes());
            }
        }
        Ok(keccak256(&buf))
    }

    fn validate(
        &self,
        auth: &SessionAuthorization,
        _batch: &CallBatch,
        ctx: &ValidationContext<'_>,
    ) -> Result<Verdict, PolicyError> {
        if let Some(code) = base_checks(self.id, self.snapshot_hash()?, auth, ctx) {
            return Ok(Verdict::fail(code));
        }
        Ok(Verdict::pass())
    }

    fn on_executed(
        &self,
        executor: Address,
        _auth: &SessionAuthorization,
        batch: &CallBatch,
        cost_used: u64,
    ) -> Result<(), PolicyError> {
        let charge = {
            let mode = self.mode.read().map_err(|_| PolicyError::LockError)?;
            match *mode {
                PricingMode::Metered => u128::from(cost_used),
                PricingMode::FixedPerCall(price) => {
                    u128::from(price).saturating_mul(batch.len() as u128)
                }
            }
        };

        let mut budgets = self.budgets.write().map_err(|_| PolicyError::LockError)?;
        let available = budgets.get(&executor).copied().unwrap_or(0);
        if available < charge {
            return Err(PolicyError::BudgetExhausted {
                executor,
                needed: charge,
                available,
            });
        }
        budgets.insert(executor, available - charge);
        Ok(())
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// The governance capability gating registry mutation: the owner plus up to
/// two designated delegate roles.
pub struct GovernanceCapability {
    owner: Address,
    registrar: RwLock<Option<Address>>,
    operator: RwLock<Option<Address>>,
}

impl GovernanceCapability {
    pub fn new(owner: Address) -> Self {
        Self {
            owner,
            registrar: RwLock::new(None),
            operator: RwLock::new(None),
        }
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    /// Delegate the registrar role. Owner only.
    pub fn set_registrar(
        &self,
        caller: Address,
        delegate: Option<Address>,
    ) -> Result<(), RegistryError> {
        if caller != self.owner {
            return Err(RegistryError::NotAuthorized(caller));
        }
        let mut registrar = self.registrar.write().map_err(|_| RegistryError::LockError)?;
        *registrar = delegate;
        Ok(())
    }

    /// Delegate the operator role. Owner only.
    pub fn set_operator(
        &self,
        caller: Address,
        delegate: Option<Address>,
    ) -> Result<(), RegistryError> {
        if caller != self.owner {
            return Err(RegistryError::NotAuthorized(caller));
        }
        let mut operator = self.operator.write().map_err(|_| RegistryError::LockError)?;
        *operator = delegate;
        Ok(())
    }

    /// Authorize a caller: owner or one of the delegated roles.
    pub fn ensure(&self, caller: Address) -> Result<(), RegistryError> {
        if caller == self.owner {
            return Ok(());
        }
        let registrar = self.registrar.read().map_err(|_| RegistryError::LockError)?;
        if *registrar == Some(caller) {
            return Ok(());
        }
        let operator = self.operator.read().map_err(|_| RegistryError::LockError)?;
        if *operator == Some(caller) {
            return Ok(());
        }
        Err(RegistryError::NotAuthorized(caller))
    }
}

/// A registered policy plus human-readable metadata.
#[derive(Clone)]
pub struct RegisteredPolicy {
    pub policy: Arc<dyn Policy>,
    pub label: String,
    pub registered_at: DateTime<Utc>,
}

/// Name-to-implementation lookup for policies. Mutable only through the
/// governance capability; supports hot add/remove. Resolution happens per
/// request, so a swap takes effect on the very next request.
pub struct PolicyRegistry {
    governance: GovernanceCapability,
    entries: RwLock<HashMap<PolicyId, RegisteredPolicy>>,
}

impl PolicyRegistry {
    pub fn new(governance: GovernanceCapability) -> Self {
        Self {
            governance,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn governance(&self) -> &GovernanceCapability {
        &self.governance
    }

    /// Bind a policy under its id. A bound id must be removed explicitly
    /// before it can be bound again; there is no silent overwrite.
    pub fn register(
        &self,
        caller: Address,
        policy: Arc<dyn Policy>,
        label: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.governance.ensure(caller)?;
        let id = policy.id();
        let mut entries = self.entries.write().map_err(|_| RegistryError::LockError)?;
        if entries.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        let label = label.into();
        info!(policy = %id, %label, "Policy registered");
        entries.insert(
            id,
            RegisteredPolicy {
                policy,
                label,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn unregister(&self, caller: Address, id: PolicyId) -> Result<(), RegistryError> {
        self.governance.ensure(caller)?;
        let mut entries = self.entries.write().map_err(|_| RegistryError::LockError)?;
        if entries.remove(&id).is_none() {
            return Err(RegistryError::NotFound(id));
        }
        info!(policy = %id, "Policy unregistered");
        Ok(())
    }

    /// Resolve a policy for one request. Callers must not cache the result
    /// across requests.
    pub fn get(&self, id: PolicyId) -> Result<Arc<dyn Policy>, RegistryError> {
        let entries = self.entries.read().map_err(|_| RegistryError::LockError)?;
        entries
            .get(&id)
            .map(|entry| Arc::clone(&entry.policy))
            .ok_or(RegistryError::NotFound(id))
    }

    /// Metadata for a bound policy.
    pub fn record(&self, id: PolicyId) -> Result<RegisteredPolicy, RegistryError> {
        let entries = self.entries.read().map_err(|_| RegistryError::LockError)?;
        entries.get(&id).cloned().ok_or(RegistryError::NotFound(id))
    }
}

/// Policy-internal errors. Verdict rejections are not errors; these are.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Executor {executor} budget exhausted: needed {needed}, available {available}")]
    BudgetExhausted {
        executor: Address,
        needed: u128,
        available: u128,
    },

    #[error("Lock error")]
    LockError,
}

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Caller {0} lacks the governance capability")]
    NotAuthorized(Address),

    #[error("Policy already registered: {0}")]
    AlreadyRegistered(PolicyId),

    #[error("Policy not found: {0}")]
    NotFound(PolicyId),

    #[error("Lock error")]
    LockError,
}
