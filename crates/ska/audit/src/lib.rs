//! SKA Audit - The append-only accounting view
//!
//! Every record is written once and never mutated or deleted; the log is the
//! interface off-system reconciliation consumes.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use ska_types::{
    AuditEvent, AuditRecord, ExecutionRecord, ReimbursementFailedRecord, SponsorshipUsedRecord,
    SubsidyPaidRecord,
};
use std::sync::RwLock;
use thiserror::Error;

/// Append-only record store shared across the funding and execution tiers.
pub struct AuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    /// Append one event. The only mutating operation on the log.
    pub fn append(&self, at: DateTime<Utc>, event: AuditEvent) -> Result<(), AuditError> {
        let mut records = self.records.write().map_err(|_| AuditError::LockError)?;
        records.push(AuditRecord::new(at, event));
        Ok(())
    }

    /// Snapshot of every record, in append order.
    pub fn records(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let records = self.records.read().map_err(|_| AuditError::LockError)?;
        Ok(records.clone())
    }

    pub fn executions(&self) -> Result<Vec<ExecutionRecord>, AuditError> {
        Ok(self
            .records()?
            .into_iter()
            .filter_map(|r| match r.event {
                AuditEvent::Execution(rec) => Some(rec),
                _ => None,
            })
            .collect())
    }

    pub fn sponsorships(&self) -> Result<Vec<SponsorshipUsedRecord>, AuditError> {
        Ok(self
            .records()?
            .into_iter()
            .filter_map(|r| match r.event {
                AuditEvent::SponsorshipUsed(rec) => Some(rec),
                _ => None,
            })
            .collect())
    }

    pub fn subsidies(&self) -> Result<Vec<SubsidyPaidRecord>, AuditError> {
        Ok(self
            .records()?
            .into_iter()
            .filter_map(|r| match r.event {
                AuditEvent::SubsidyPaid(rec) => Some(rec),
                _ => None,
            })
            .collect())
    }

    pub fn failed_reimbursements(&self) -> Result<Vec<ReimbursementFailedRecord>, AuditError> {
        Ok(self
            .records()?
            .into_iter()
            .filter_map(|r| match r.event {
                AuditEvent::ReimbursementFailed(rec) => Some(rec),
                _ => None,
            })
            .collect())
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Audit-log errors.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Lock error")]
    LockError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ska_types::{Address, Hash32, PolicyId};

    #[test]
    fn records_accumulate_in_append_order() {
        let log = AuditLog::new();
        let now = Utc::now();

        log.append(
            now,
            AuditEvent::Execution(ExecutionRecord {
                principal: Address([1u8; 20]),
                policy_id: PolicyId(Hash32([2u8; 32])),
                batch_hash: Hash32([3u8; 32]),
                snapshot_hash: Hash32([4u8; 32]),
                all_succeeded: true,
            }),
        )
        .unwrap();
        log.append(
            now,
            AuditEvent::ReimbursementFailed(ReimbursementFailedRecord {
                payee: Address([5u8; 20]),
                amount: 42,
            }),
        )
        .unwrap();

        let records = log.records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].event, AuditEvent::Execution(_)));
        assert!(matches!(records[1].event, AuditEvent::ReimbursementFailed(_)));

        assert_eq!(log.executions().unwrap().len(), 1);
        assert_eq!(log.failed_reimbursements().unwrap().len(), 1);
        assert!(log.sponsorships().unwrap().is_empty());
    }

    // Off-system reconciliation reads the log as JSON lines.
    #[test]
    fn records_serialize_to_json() {
        let log = AuditLog::new();
        log.append(
            Utc::now(),
            AuditEvent::SponsorshipUsed(SponsorshipUsedRecord {
                funder: Address([1u8; 20]),
                principal: Address([2u8; 20]),
                cost_used: 60_000,
                policy_id: PolicyId(Hash32([3u8; 32])),
            }),
        )
        .unwrap();

        let record = &log.records().unwrap()[0];
        let json = serde_json::to_string(record).unwrap();
        assert!(json.contains("SponsorshipUsed"));
        assert!(json.contains("60000"));

        let back: AuditRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.record_id, record.record_id);
    }
}
