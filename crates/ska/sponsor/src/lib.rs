//! SKA Sponsor - Tiered funding for sponsored execution
//!
//! Two tiers. The [`SponsorLedger`] holds per-funder budgets bound to policy
//! ids and answers "will this funder pay for this request", enforcing
//! anti-abuse limits and a per-(funder, policy) circuit breaker before any
//! money moves. The [`SubsidyEngine`] sits behind it and pays a configured
//! share of each settled cost back to the funder from a shared pool.
//!
//! Every debit, subsidy and failed reimbursement lands in the shared
//! [`AuditLog`].

#![deny(unsafe_code)]

use chrono::{DateTime, Duration, NaiveDate, Utc};
use ska_audit::AuditLog;
use ska_types::{
    Address, AuditEvent, PolicyId, ReimbursementFailedRecord, SponsorshipUsedRecord,
    SubsidyPaidRecord,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Subsidy rates are expressed in basis points of the settled cost.
pub const MAX_SUBSIDY_RATE_BPS: u16 = 10_000;

/// Destination for reimbursement payouts. Delivery is allowed to fail; the
/// ledger treats a `false` return as soft and keeps the debit.
pub trait PayoutSink {
    fn credit(&mut self, payee: Address, amount: u128) -> bool;
}

/// Circuit-breaker thresholds, shared by every (funder, policy) pair.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker. Cleared only by a
    /// recorded success.
    pub max_consecutive: u32,
    /// Failures inside the rolling window that open the breaker.
    pub max_in_window: u32,
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive: 5,
            max_in_window: 10,
            window: Duration::minutes(5),
        }
    }
}

/// Failure tallies for one (funder, policy) pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FailureCounter {
    pub consecutive: u32,
    pub in_window: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

impl FailureCounter {
    /// Drop the windowed count once the window has elapsed since the last
    /// failure. Consecutive failures survive; only a success clears those.
    ///
    /// Coarse decay: the count clears only after a full window with no
    /// failures at all, so failures spaced closer than the window keep
    /// accumulating toward the threshold rather than sliding out one by one
    /// the way `FunderAccount::prune_recent` expires rate-limit entries.
    fn decay(&mut self, now: DateTime<Utc>, window: Duration) {
        if let Some(last) = self.last_failure {
            if now - last >= window {
                self.in_window = 0;
            }
        }
    }

    fn record(&mut self, now: DateTime<Utc>, window: Duration) {
        self.decay(now, window);
        self.consecutive = self.consecutive.saturating_add(1);
        self.in_window = self.in_window.saturating_add(1);
        self.last_failure = Some(now);
    }

    fn tripped(&self, config: &BreakerConfig) -> bool {
        self.consecutive >= config.max_consecutive || self.in_window >= config.max_in_window
    }
}

/// One funder's budget and limits. Caps default to unlimited and the
/// anti-abuse knobs to off; an operator tightens them after onboarding.
#[derive(Clone, Debug)]
pub struct FunderAccount {
    /// Spendable deposit. Debited on every settled sponsorship; subsidies
    /// credit it back.
    pub budget: u128,
    pub allowed_policies: BTreeSet<PolicyId>,
    /// Cumulative cap per UTC day.
    pub daily_cap: u128,
    pub per_action_cap: u64,
    /// Requests cheaper than this are rejected outright. Griefing floor.
    pub min_action_cost: u64,
    /// Maximum settled sponsorships inside `rate_window`.
    pub rate_limit: u32,
    pub rate_window: Duration,
    day_usage: HashMap<NaiveDate, u128>,
    recent: VecDeque<DateTime<Utc>>,
}

impl FunderAccount {
    fn new() -> Self {
        Self {
            budget: 0,
            allowed_policies: BTreeSet::new(),
            daily_cap: u128::MAX,
            per_action_cap: u64::MAX,
            min_action_cost: 0,
            rate_limit: u32::MAX,
            rate_window: Duration::zero(),
            day_usage: HashMap::new(),
            recent: VecDeque::new(),
        }
    }

    pub fn usage_on(&self, day: NaiveDate) -> u128 {
        self.day_usage.get(&day).copied().unwrap_or(0)
    }

    fn prune_recent(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.rate_window;
        while let Some(front) = self.recent.front() {
            if *front <= cutoff {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// First-tier funding ledger. Policy ids are bound to exactly one funder at
/// onboarding; a request under a bound policy draws from that funder alone.
pub struct SponsorLedger {
    accounts: RwLock<HashMap<Address, FunderAccount>>,
    bindings: RwLock<HashMap<PolicyId, Address>>,
    failures: RwLock<HashMap<(Address, PolicyId), FailureCounter>>,
    breaker: BreakerConfig,
    subsidy: Arc<SubsidyEngine>,
    audit: Arc<AuditLog>,
}

impl SponsorLedger {
    pub fn new(subsidy: Arc<SubsidyEngine>, audit: Arc<AuditLog>) -> Self {
        Self::with_breaker(BreakerConfig::default(), subsidy, audit)
    }

    pub fn with_breaker(
        breaker: BreakerConfig,
        subsidy: Arc<SubsidyEngine>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            breaker,
            subsidy,
            audit,
        }
    }

    /// Fund a budget and enable a policy id in one step. Caps stay at their
    /// unlimited defaults only when the funder is brand new; repeat deposits
    /// never loosen limits an operator has tightened.
    pub fn deposit_and_initialize(
        &self,
        funder: Address,
        deposit: u128,
        policy_id: PolicyId,
    ) -> Result<(), SponsorError> {
        let mut bindings = self.bindings.write().map_err(|_| SponsorError::LockError)?;
        if let Some(bound) = bindings.get(&policy_id) {
            if *bound != funder {
                return Err(SponsorError::PolicyBoundElsewhere {
                    policy_id,
                    funder: *bound,
                });
            }
        }

        let mut accounts = self.accounts.write().map_err(|_| SponsorError::LockError)?;
        let account = accounts.entry(funder).or_insert_with(FunderAccount::new);
        account.budget = account.budget.saturating_add(deposit);
        account.allowed_policies.insert(policy_id);
        bindings.insert(policy_id, funder);

        tracing::info!(
            funder = %funder,
            deposit,
            budget = account.budget,
            "sponsor deposit"
        );
        Ok(())
    }

    pub fn set_caps(
        &self,
        funder: Address,
        daily_cap: u128,
        per_action_cap: u64,
    ) -> Result<(), SponsorError> {
        let mut accounts = self.accounts.write().map_err(|_| SponsorError::LockError)?;
        let account = accounts
            .get_mut(&funder)
            .ok_or(SponsorError::UnknownFunder(funder))?;
        account.daily_cap = daily_cap;
        account.per_action_cap = per_action_cap;
        Ok(())
    }

    pub fn set_anti_abuse(
        &self,
        funder: Address,
        min_action_cost: u64,
        rate_limit: u32,
        rate_window: Duration,
    ) -> Result<(), SponsorError> {
        let mut accounts = self.accounts.write().map_err(|_| SponsorError::LockError)?;
        let account = accounts
            .get_mut(&funder)
            .ok_or(SponsorError::UnknownFunder(funder))?;
        account.min_action_cost = min_action_cost;
        account.rate_limit = rate_limit;
        account.rate_window = rate_window;
        Ok(())
    }

    /// Stop funding a policy without touching the budget.
    pub fn disable_policy(&self, funder: Address, policy_id: PolicyId) -> Result<(), SponsorError> {
        let mut accounts = self.accounts.write().map_err(|_| SponsorError::LockError)?;
        let account = accounts
            .get_mut(&funder)
            .ok_or(SponsorError::UnknownFunder(funder))?;
        account.allowed_policies.remove(&policy_id);
        Ok(())
    }

    /// The funder a policy id draws from, if any.
    pub fn funder_of(&self, policy_id: PolicyId) -> Result<Option<Address>, SponsorError> {
        let bindings = self.bindings.read().map_err(|_| SponsorError::LockError)?;
        Ok(bindings.get(&policy_id).copied())
    }

    pub fn account(&self, funder: Address) -> Result<Option<FunderAccount>, SponsorError> {
        let accounts = self.accounts.read().map_err(|_| SponsorError::LockError)?;
        Ok(accounts.get(&funder).cloned())
    }

    pub fn failure_counter(
        &self,
        funder: Address,
        policy_id: PolicyId,
    ) -> Result<FailureCounter, SponsorError> {
        let failures = self.failures.read().map_err(|_| SponsorError::LockError)?;
        Ok(failures
            .get(&(funder, policy_id))
            .copied()
            .unwrap_or_default())
    }

    /// Settle sponsorship for one executed request.
    ///
    /// Checks run cheapest-reject-first: breaker, minimum cost, rate limit,
    /// policy allow-set, budget, per-action cap, daily cap. Only a request
    /// that clears them all debits the budget; the debit then stands even if
    /// reimbursement delivery or the subsidy payout fails.
    pub fn handle_sponsorship(
        &self,
        principal: Address,
        cost_used: u64,
        policy_id: PolicyId,
        payee: Option<Address>,
        now: DateTime<Utc>,
        payout: &mut dyn PayoutSink,
    ) -> Result<(), SponsorError> {
        let funder = self
            .funder_of(policy_id)?
            .ok_or(SponsorError::UnknownPolicyBinding(policy_id))?;

        {
            let mut failures = self.failures.write().map_err(|_| SponsorError::LockError)?;
            let counter = failures.entry((funder, policy_id)).or_default();
            counter.decay(now, self.breaker.window);
            if counter.tripped(&self.breaker) {
                return Err(SponsorError::BreakerOpen { funder, policy_id });
            }
        }

        {
            let mut accounts = self.accounts.write().map_err(|_| SponsorError::LockError)?;
            let account = accounts
                .get_mut(&funder)
                .ok_or(SponsorError::UnknownFunder(funder))?;

            if cost_used < account.min_action_cost {
                return Err(SponsorError::BelowMinimumCost {
                    cost: cost_used,
                    minimum: account.min_action_cost,
                });
            }

            account.prune_recent(now);
            if account.recent.len() as u64 >= account.rate_limit as u64 {
                return Err(SponsorError::RateLimited {
                    funder,
                    limit: account.rate_limit,
                });
            }

            if !account.allowed_policies.contains(&policy_id) {
                return Err(SponsorError::PolicyNotAllowed(policy_id));
            }

            let cost = cost_used as u128;
            if account.budget < cost {
                return Err(SponsorError::InsufficientBudget {
                    funder,
                    needed: cost,
                    available: account.budget,
                });
            }
            if cost_used > account.per_action_cap {
                return Err(SponsorError::PerActionCapExceeded {
                    cost: cost_used,
                    cap: account.per_action_cap,
                });
            }
            let day = now.date_naive();
            let used_today = account.usage_on(day);
            if used_today.saturating_add(cost) > account.daily_cap {
                return Err(SponsorError::DailyCapExceeded {
                    funder,
                    cap: account.daily_cap,
                });
            }

            account.budget -= cost;
            *account.day_usage.entry(day).or_insert(0) = used_today + cost;
            account.recent.push_back(now);
        }

        {
            let mut failures = self.failures.write().map_err(|_| SponsorError::LockError)?;
            if let Some(counter) = failures.get_mut(&(funder, policy_id)) {
                counter.consecutive = 0;
            }
        }

        self.audit.append(
            now,
            AuditEvent::SponsorshipUsed(SponsorshipUsedRecord {
                funder,
                principal,
                cost_used,
                policy_id,
            }),
        )?;

        // Second tier: a subsidy share of the settled cost flows back into
        // the funder's budget.
        let paid = self.subsidy.compensate_client(funder, cost_used, policy_id, now)?;
        if paid > 0 {
            let mut accounts = self.accounts.write().map_err(|_| SponsorError::LockError)?;
            if let Some(account) = accounts.get_mut(&funder) {
                account.budget = account.budget.saturating_add(paid);
            }
        }

        // Reimbursement delivery is best-effort. The funds were already
        // debited above; a refused credit is recorded and retried off-system.
        if let Some(payee) = payee {
            let amount = cost_used as u128;
            if !payout.credit(payee, amount) {
                tracing::warn!(payee = %payee, amount, "reimbursement delivery failed");
                self.audit.append(
                    now,
                    AuditEvent::ReimbursementFailed(ReimbursementFailedRecord { payee, amount }),
                )?;
            }
        }

        Ok(())
    }

    /// Count a failed sponsored request against the breaker.
    pub fn record_failure(
        &self,
        funder: Address,
        policy_id: PolicyId,
        now: DateTime<Utc>,
    ) -> Result<(), SponsorError> {
        let mut failures = self.failures.write().map_err(|_| SponsorError::LockError)?;
        let counter = failures.entry((funder, policy_id)).or_default();
        counter.record(now, self.breaker.window);
        tracing::debug!(
            funder = %funder,
            consecutive = counter.consecutive,
            in_window = counter.in_window,
            "sponsorship failure recorded"
        );
        Ok(())
    }

    /// Like [`record_failure`](Self::record_failure) but also debits a flat
    /// attempt fee, clamped to the remaining budget. Independent of the
    /// cost-debit path.
    pub fn record_failure_and_charge(
        &self,
        funder: Address,
        policy_id: PolicyId,
        attempt_fee: u64,
        now: DateTime<Utc>,
    ) -> Result<(), SponsorError> {
        self.record_failure(funder, policy_id, now)?;
        let mut accounts = self.accounts.write().map_err(|_| SponsorError::LockError)?;
        let account = accounts
            .get_mut(&funder)
            .ok_or(SponsorError::UnknownFunder(funder))?;
        account.budget = account.budget.saturating_sub(attempt_fee as u128);
        Ok(())
    }

    /// Clear the consecutive-failure count after an out-of-band success.
    pub fn record_success(&self, funder: Address, policy_id: PolicyId) -> Result<(), SponsorError> {
        let mut failures = self.failures.write().map_err(|_| SponsorError::LockError)?;
        if let Some(counter) = failures.get_mut(&(funder, policy_id)) {
            counter.consecutive = 0;
        }
        Ok(())
    }
}

/// Second-tier pool that pays funders back a per-policy share of each
/// settled cost.
pub struct SubsidyEngine {
    rates: RwLock<HashMap<PolicyId, u16>>,
    balance: RwLock<u128>,
    audit: Arc<AuditLog>,
}

impl SubsidyEngine {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self {
            rates: RwLock::new(HashMap::new()),
            balance: RwLock::new(0),
            audit,
        }
    }

    pub fn fund(&self, amount: u128) -> Result<(), SponsorError> {
        let mut balance = self.balance.write().map_err(|_| SponsorError::LockError)?;
        *balance = balance.saturating_add(amount);
        Ok(())
    }

    pub fn balance(&self) -> Result<u128, SponsorError> {
        let balance = self.balance.read().map_err(|_| SponsorError::LockError)?;
        Ok(*balance)
    }

    pub fn set_rate(&self, policy_id: PolicyId, rate_bps: u16) -> Result<(), SponsorError> {
        if rate_bps > MAX_SUBSIDY_RATE_BPS {
            return Err(SponsorError::RateOutOfRange(rate_bps));
        }
        let mut rates = self.rates.write().map_err(|_| SponsorError::LockError)?;
        rates.insert(policy_id, rate_bps);
        Ok(())
    }

    pub fn rate_of(&self, policy_id: PolicyId) -> Result<u16, SponsorError> {
        let rates = self.rates.read().map_err(|_| SponsorError::LockError)?;
        Ok(rates.get(&policy_id).copied().unwrap_or(0))
    }

    /// Pay the funder its configured share of a settled cost. Returns the
    /// amount actually transferred. A zero rate is a silent no-op; an
    /// underfunded pool records the shortfall unsettled and pays nothing.
    pub fn compensate_client(
        &self,
        funder: Address,
        cost_used: u64,
        policy_id: PolicyId,
        now: DateTime<Utc>,
    ) -> Result<u128, SponsorError> {
        let rate_bps = self.rate_of(policy_id)?;
        if rate_bps == 0 {
            return Ok(0);
        }
        let amount = cost_used as u128 * rate_bps as u128 / MAX_SUBSIDY_RATE_BPS as u128;
        if amount == 0 {
            return Ok(0);
        }

        let settled = {
            let mut balance = self.balance.write().map_err(|_| SponsorError::LockError)?;
            if *balance >= amount {
                *balance -= amount;
                true
            } else {
                false
            }
        };

        self.audit.append(
            now,
            AuditEvent::SubsidyPaid(SubsidyPaidRecord {
                funder,
                cost_used,
                amount,
                rate_bps,
                policy_id,
                settled,
            }),
        )?;

        if settled {
            Ok(amount)
        } else {
            tracing::warn!(funder = %funder, amount, "subsidy pool underfunded");
            Ok(0)
        }
    }
}

/// Funding-tier errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SponsorError {
    #[error("Circuit breaker open for funder {funder} policy {policy_id:?}")]
    BreakerOpen { funder: Address, policy_id: PolicyId },
    #[error("Cost {cost} below funder minimum {minimum}")]
    BelowMinimumCost { cost: u64, minimum: u64 },
    #[error("Funder {funder} rate limit of {limit} reached")]
    RateLimited { funder: Address, limit: u32 },
    #[error("Policy {0:?} not in funder allow-set")]
    PolicyNotAllowed(PolicyId),
    #[error("Funder {funder} budget {available} cannot cover {needed}")]
    InsufficientBudget {
        funder: Address,
        needed: u128,
        available: u128,
    },
    #[error("Cost {cost} exceeds per-action cap {cap}")]
    PerActionCapExceeded { cost: u64, cap: u64 },
    #[error("Funder {funder} daily cap {cap} exceeded")]
    DailyCapExceeded { funder: Address, cap: u128 },
    #[error("No funder bound to policy {0:?}")]
    UnknownPolicyBinding(PolicyId),
    #[error("Unknown funder {0}")]
    UnknownFunder(Address),
    #[error("Policy {policy_id:?} already bound to funder {funder}")]
    PolicyBoundElsewhere { policy_id: PolicyId, funder: Address },
    #[error("Subsidy rate {0} exceeds 10000 bps")]
    RateOutOfRange(u16),
    #[error("Lock error")]
    LockError,
}

impl From<ska_audit::AuditError> for SponsorError {
    fn from(_: ska_audit::AuditError) -> Self {
        SponsorError::LockError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ska_types::Hash32;

    struct RecordingSink {
        accept: bool,
        credited: Vec<(Address, u128)>,
    }

    impl RecordingSink {
        fn accepting() -> Self {
            Self {
                accept: true,
                credited: Vec::new(),
            }
        }

        fn refusing() -> Self {
            Self {
                accept: false,
                credited: Vec::new(),
            }
        }
    }

    impl PayoutSink for RecordingSink {
        fn credit(&mut self, payee: Address, amount: u128) -> bool {
            if self.accept {
                self.credited.push((payee, amount));
            }
            self.accept
        }
    }

    fn ledger() -> (SponsorLedger, Arc<SubsidyEngine>, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        let subsidy = Arc::new(SubsidyEngine::new(Arc::clone(&audit)));
        let ledger = SponsorLedger::new(Arc::clone(&subsidy), Arc::clone(&audit));
        (ledger, subsidy, audit)
    }

    fn policy(n: u8) -> PolicyId {
        PolicyId(Hash32([n; 32]))
    }

    const FUNDER: Address = Address([0xAA; 20]);
    const PRINCIPAL: Address = Address([0xBB; 20]);
    const RELAYER: Address = Address([0xCC; 20]);

    #[test]
    fn settled_sponsorship_debits_budget_and_reimburses() {
        let (ledger, _, audit) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 1_000_000, policy(1)).unwrap();

        let mut sink = RecordingSink::accepting();
        ledger
            .handle_sponsorship(PRINCIPAL, 60_000, policy(1), Some(RELAYER), now, &mut sink)
            .unwrap();

        let account = ledger.account(FUNDER).unwrap().unwrap();
        assert_eq!(account.budget, 940_000);
        assert_eq!(sink.credited, vec![(RELAYER, 60_000)]);
        assert_eq!(audit.sponsorships().unwrap().len(), 1);
    }

    #[test]
    fn unbound_policy_is_rejected() {
        let (ledger, _, _) = ledger();
        let mut sink = RecordingSink::accepting();
        let err = ledger
            .handle_sponsorship(PRINCIPAL, 60_000, policy(9), None, Utc::now(), &mut sink)
            .unwrap_err();
        assert_eq!(err, SponsorError::UnknownPolicyBinding(policy(9)));
    }

    #[test]
    fn minimum_cost_floor_rejects_cheap_requests() {
        let (ledger, _, _) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 1_000_000, policy(1)).unwrap();
        ledger
            .set_anti_abuse(FUNDER, 100_000, u32::MAX, Duration::zero())
            .unwrap();

        let mut sink = RecordingSink::accepting();
        let err = ledger
            .handle_sponsorship(PRINCIPAL, 50_000, policy(1), None, now, &mut sink)
            .unwrap_err();
        assert_eq!(
            err,
            SponsorError::BelowMinimumCost {
                cost: 50_000,
                minimum: 100_000
            }
        );
        // Nothing moved.
        assert_eq!(ledger.account(FUNDER).unwrap().unwrap().budget, 1_000_000);
    }

    #[test]
    fn rate_limit_gates_by_rolling_window() {
        let (ledger, _, _) = ledger();
        let start = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 10_000_000, policy(1)).unwrap();
        ledger
            .set_anti_abuse(FUNDER, 0, 2, Duration::seconds(10))
            .unwrap();

        let mut sink = RecordingSink::accepting();
        ledger
            .handle_sponsorship(PRINCIPAL, 30_000, policy(1), None, start, &mut sink)
            .unwrap();
        ledger
            .handle_sponsorship(
                PRINCIPAL,
                30_000,
                policy(1),
                None,
                start + Duration::seconds(1),
                &mut sink,
            )
            .unwrap();

        let err = ledger
            .handle_sponsorship(
                PRINCIPAL,
                30_000,
                policy(1),
                None,
                start + Duration::seconds(2),
                &mut sink,
            )
            .unwrap_err();
        assert!(matches!(err, SponsorError::RateLimited { limit: 2, .. }));

        // Window moves on, the first entries fall out.
        ledger
            .handle_sponsorship(
                PRINCIPAL,
                30_000,
                policy(1),
                None,
                start + Duration::seconds(11),
                &mut sink,
            )
            .unwrap();
    }

    #[test]
    fn per_action_and_daily_caps_bind() {
        let (ledger, _, _) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 10_000_000, policy(1)).unwrap();
        ledger.set_caps(FUNDER, 100_000, 70_000).unwrap();

        let mut sink = RecordingSink::accepting();
        let err = ledger
            .handle_sponsorship(PRINCIPAL, 80_000, policy(1), None, now, &mut sink)
            .unwrap_err();
        assert_eq!(
            err,
            SponsorError::PerActionCapExceeded {
                cost: 80_000,
                cap: 70_000
            }
        );

        ledger
            .handle_sponsorship(PRINCIPAL, 60_000, policy(1), None, now, &mut sink)
            .unwrap();
        let err = ledger
            .handle_sponsorship(PRINCIPAL, 60_000, policy(1), None, now, &mut sink)
            .unwrap_err();
        assert!(matches!(err, SponsorError::DailyCapExceeded { .. }));
    }

    #[test]
    fn breaker_opens_after_consecutive_failures_and_resets_on_success() {
        let (ledger, _, _) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 10_000_000, policy(1)).unwrap();

        for _ in 0..5 {
            ledger.record_failure(FUNDER, policy(1), now).unwrap();
        }
        let mut sink = RecordingSink::accepting();
        let err = ledger
            .handle_sponsorship(PRINCIPAL, 60_000, policy(1), None, now, &mut sink)
            .unwrap_err();
        assert!(matches!(err, SponsorError::BreakerOpen { .. }));

        ledger.record_success(FUNDER, policy(1)).unwrap();
        ledger
            .handle_sponsorship(PRINCIPAL, 60_000, policy(1), None, now, &mut sink)
            .unwrap();
    }

    #[test]
    fn success_clears_consecutive_but_not_windowed_failures() {
        let (ledger, _, _) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 10_000_000, policy(1)).unwrap();

        for _ in 0..3 {
            ledger.record_failure(FUNDER, policy(1), now).unwrap();
        }
        let counter = ledger.failure_counter(FUNDER, policy(1)).unwrap();
        assert_eq!(counter.consecutive, 3);
        assert_eq!(counter.in_window, 3);

        ledger.record_success(FUNDER, policy(1)).unwrap();
        let counter = ledger.failure_counter(FUNDER, policy(1)).unwrap();
        assert_eq!(counter.consecutive, 0);
        // The windowed count only decays with time, never with a success.
        assert_eq!(counter.in_window, 3);

        // A settled sponsorship clears consecutive the same way.
        ledger.record_failure(FUNDER, policy(1), now).unwrap();
        let mut sink = RecordingSink::accepting();
        ledger
            .handle_sponsorship(PRINCIPAL, 60_000, policy(1), None, now, &mut sink)
            .unwrap();
        let counter = ledger.failure_counter(FUNDER, policy(1)).unwrap();
        assert_eq!(counter.consecutive, 0);
        assert_eq!(counter.in_window, 4);
    }

    #[test]
    fn breaker_is_checked_before_anything_else() {
        let (ledger, _, _) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 10_000_000, policy(1)).unwrap();
        // A request this cheap would be rejected by the minimum-cost floor;
        // an open breaker must win instead.
        ledger
            .set_anti_abuse(FUNDER, 100_000, u32::MAX, Duration::zero())
            .unwrap();
        for _ in 0..5 {
            ledger.record_failure(FUNDER, policy(1), now).unwrap();
        }

        let mut sink = RecordingSink::accepting();
        let err = ledger
            .handle_sponsorship(PRINCIPAL, 1, policy(1), None, now, &mut sink)
            .unwrap_err();
        assert!(matches!(err, SponsorError::BreakerOpen { .. }));
    }

    #[test]
    fn windowed_failures_decay_after_the_window() {
        let breaker = BreakerConfig {
            max_consecutive: u32::MAX,
            max_in_window: 3,
            window: Duration::seconds(30),
        };
        let audit = Arc::new(AuditLog::new());
        let subsidy = Arc::new(SubsidyEngine::new(Arc::clone(&audit)));
        let ledger = SponsorLedger::with_breaker(breaker, subsidy, audit);
        let start = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 10_000_000, policy(1)).unwrap();

        for _ in 0..3 {
            ledger.record_failure(FUNDER, policy(1), start).unwrap();
        }
        let mut sink = RecordingSink::accepting();
        let err = ledger
            .handle_sponsorship(PRINCIPAL, 60_000, policy(1), None, start, &mut sink)
            .unwrap_err();
        assert!(matches!(err, SponsorError::BreakerOpen { .. }));

        ledger
            .handle_sponsorship(
                PRINCIPAL,
                60_000,
                policy(1),
                None,
                start + Duration::seconds(31),
                &mut sink,
            )
            .unwrap();
    }

    #[test]
    fn failed_reimbursement_keeps_the_debit_and_is_recorded() {
        let (ledger, _, audit) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 1_000_000, policy(1)).unwrap();

        let mut sink = RecordingSink::refusing();
        ledger
            .handle_sponsorship(PRINCIPAL, 60_000, policy(1), Some(RELAYER), now, &mut sink)
            .unwrap();

        assert_eq!(ledger.account(FUNDER).unwrap().unwrap().budget, 940_000);
        let failed = audit.failed_reimbursements().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payee, RELAYER);
        assert_eq!(failed[0].amount, 60_000);
    }

    #[test]
    fn policy_binding_is_exclusive() {
        let (ledger, _, _) = ledger();
        let other = Address([0xDD; 20]);
        ledger.deposit_and_initialize(FUNDER, 1_000, policy(1)).unwrap();
        let err = ledger
            .deposit_and_initialize(other, 1_000, policy(1))
            .unwrap_err();
        assert_eq!(
            err,
            SponsorError::PolicyBoundElsewhere {
                policy_id: policy(1),
                funder: FUNDER
            }
        );
    }

    #[test]
    fn repeat_deposit_keeps_tightened_caps() {
        let (ledger, _, _) = ledger();
        ledger.deposit_and_initialize(FUNDER, 1_000, policy(1)).unwrap();
        ledger.set_caps(FUNDER, 500, 200).unwrap();
        ledger.deposit_and_initialize(FUNDER, 1_000, policy(2)).unwrap();

        let account = ledger.account(FUNDER).unwrap().unwrap();
        assert_eq!(account.budget, 2_000);
        assert_eq!(account.daily_cap, 500);
        assert_eq!(account.per_action_cap, 200);
    }

    #[test]
    fn attempt_fee_is_clamped_to_budget() {
        let (ledger, _, _) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 10_000, policy(1)).unwrap();
        ledger
            .record_failure_and_charge(FUNDER, policy(1), 50_000, now)
            .unwrap();
        assert_eq!(ledger.account(FUNDER).unwrap().unwrap().budget, 0);
        assert_eq!(
            ledger.failure_counter(FUNDER, policy(1)).unwrap().consecutive,
            1
        );
    }

    #[test]
    fn subsidy_credits_funder_and_burns_pool() {
        let (ledger, subsidy, audit) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 1_000_000, policy(1)).unwrap();
        subsidy.fund(1_000_000).unwrap();
        subsidy.set_rate(policy(1), 2_500).unwrap();

        let mut sink = RecordingSink::accepting();
        ledger
            .handle_sponsorship(PRINCIPAL, 100_000, policy(1), None, now, &mut sink)
            .unwrap();

        // 25% of 100_000 flows back.
        assert_eq!(ledger.account(FUNDER).unwrap().unwrap().budget, 925_000);
        assert_eq!(subsidy.balance().unwrap(), 975_000);
        let subsidies = audit.subsidies().unwrap();
        assert_eq!(subsidies.len(), 1);
        assert!(subsidies[0].settled);
        assert_eq!(subsidies[0].amount, 25_000);
    }

    #[test]
    fn underfunded_subsidy_pool_records_unsettled_and_pays_nothing() {
        let (ledger, subsidy, audit) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 1_000_000, policy(1)).unwrap();
        subsidy.fund(10).unwrap();
        subsidy.set_rate(policy(1), 5_000).unwrap();

        let mut sink = RecordingSink::accepting();
        ledger
            .handle_sponsorship(PRINCIPAL, 100_000, policy(1), None, now, &mut sink)
            .unwrap();

        assert_eq!(ledger.account(FUNDER).unwrap().unwrap().budget, 900_000);
        assert_eq!(subsidy.balance().unwrap(), 10);
        let subsidies = audit.subsidies().unwrap();
        assert_eq!(subsidies.len(), 1);
        assert!(!subsidies[0].settled);
    }

    #[test]
    fn zero_rate_is_a_silent_noop() {
        let (ledger, subsidy, audit) = ledger();
        let now = Utc::now();
        ledger.deposit_and_initialize(FUNDER, 1_000_000, policy(1)).unwrap();
        subsidy.fund(1_000).unwrap();

        let mut sink = RecordingSink::accepting();
        ledger
            .handle_sponsorship(PRINCIPAL, 100_000, policy(1), None, now, &mut sink)
            .unwrap();
        assert!(audit.subsidies().unwrap().is_empty());
    }

    #[test]
    fn rate_above_ten_thousand_bps_is_rejected() {
        let (_, subsidy, _) = ledger();
        assert_eq!(
            subsidy.set_rate(policy(1), 10_001).unwrap_err(),
            SponsorError::RateOutOfRange(10_001)
        );
        subsidy.set_rate(policy(1), 10_000).unwrap();
    }

    proptest! {
        // Budget plus every successful debit is conserved regardless of the
        // request mix.
        #[test]
        fn budget_is_conserved(costs in proptest::collection::vec(1u64..200_000, 1..40)) {
            let (ledger, _, _) = ledger();
            let now = Utc::now();
            let initial: u128 = 2_000_000;
            ledger.deposit_and_initialize(FUNDER, initial, policy(1)).unwrap();

            let mut sink = RecordingSink::accepting();
            let mut spent: u128 = 0;
            for cost in costs {
                if ledger
                    .handle_sponsorship(PRINCIPAL, cost, policy(1), Some(RELAYER), now, &mut sink)
                    .is_ok()
                {
                    spent += cost as u128;
                }
            }

            let account = ledger.account(FUNDER).unwrap().unwrap();
            prop_assert_eq!(account.budget + spent, initial);
            let delivered: u128 = sink.credited.iter().map(|(_, a)| a).sum();
            prop_assert_eq!(delivered, spent);
        }
    }
}
