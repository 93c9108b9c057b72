//! Client Sign-off
//!
//! When every account owned by a client has COMPLETED for the business
//! date, one `CLIENT_REPORTING_SIGNOFF` event is published exactly once,
//! no matter how many account completions race: the winner is whoever
//! inserts the claim row.

use crate::clock::SharedClock;
use crate::errors::Result;
use crate::fabric::{topics, Broker};
use crate::models::SignoffEvent;
use crate::store::{AuditStore, EodStore};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::info;

pub struct SignoffPublisher {
    eod: Arc<EodStore>,
    audit: Arc<AuditStore>,
    broker: Arc<Broker>,
    clock: SharedClock,
}

impl SignoffPublisher {
    pub fn new(
        eod: Arc<EodStore>,
        audit: Arc<AuditStore>,
        broker: Arc<Broker>,
        clock: SharedClock,
    ) -> Self {
        Self {
            eod,
            audit,
            broker,
            clock,
        }
    }

    /// Publish the sign-off if this completion was the client's last open
    /// account for the date. Returns true when this call published.
    pub async fn maybe_signoff(&self, client_id: i64, business_date: NaiveDate) -> Result<bool> {
        let (all_done, account_count) = self.eod.client_completion(client_id, business_date)?;
        if !all_done {
            return Ok(false);
        }
        let now = self.clock.now_millis();
        if !self
            .eod
            .try_claim_signoff(client_id, business_date, account_count, now)?
        {
            return Ok(false);
        }

        let event = SignoffEvent {
            client_id,
            business_date,
            account_count,
            ts: now,
        };
        self.broker
            .publish(
                topics::CLIENT_REPORTING_SIGNOFF,
                &client_id.to_string(),
                &event,
            )
            .await?;
        self.audit.record(
            "system",
            "CLIENT_SIGNOFF",
            None,
            &format!("client {client_id} {business_date} ({account_count} accounts)"),
            now,
        )?;
        info!(client_id, %business_date, account_count, "client signed off");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::AccountInfo;
    use crate::store::{Database, EodStatus, RefDataStore};

    async fn setup() -> (SignoffPublisher, Arc<EodStore>, Arc<Broker>, RefDataStore) {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let eod = Arc::new(EodStore::new(db.clone()));
        let audit = Arc::new(AuditStore::new(db.clone()));
        let refdata = RefDataStore::new(db);
        let broker = Arc::new(Broker::new());
        broker.register_topic(topics::CLIENT_REPORTING_SIGNOFF, 1, 16);
        (
            SignoffPublisher::new(eod.clone(), audit, broker.clone(), clock),
            eod,
            broker,
            refdata,
        )
    }

    fn account(account_id: i64, client_id: i64) -> AccountInfo {
        AccountInfo {
            account_id,
            account_number: format!("ACC-{account_id}"),
            account_type: "CUSTODY".into(),
            fund_id: 10,
            fund_name: "Global Macro".into(),
            client_id,
            client_name: "Meridian AM".into(),
            base_currency: "USD".into(),
        }
    }

    #[tokio::test]
    async fn test_signoff_fires_once_when_all_accounts_complete() {
        let (publisher, eod, broker, refdata) = setup().await;
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let mut rx = broker.take_receivers(topics::CLIENT_REPORTING_SIGNOFF).unwrap();

        refdata.upsert_account(&account(1, 55)).unwrap();
        refdata.upsert_account(&account(2, 55)).unwrap();

        eod.transition(1, date, EodStatus::InProgress, None, None, 1).unwrap();
        eod.transition(1, date, EodStatus::Completed, Some(3), None, 2).unwrap();
        assert!(!publisher.maybe_signoff(55, date).await.unwrap());

        eod.transition(2, date, EodStatus::InProgress, None, None, 3).unwrap();
        eod.transition(2, date, EodStatus::Completed, Some(1), None, 4).unwrap();
        assert!(publisher.maybe_signoff(55, date).await.unwrap());
        // Replay does not publish again
        assert!(!publisher.maybe_signoff(55, date).await.unwrap());

        let envelope = rx[0].try_recv().unwrap();
        let event: SignoffEvent = envelope.decode().unwrap();
        assert_eq!(event.client_id, 55);
        assert_eq!(event.account_count, 2);
        assert!(rx[0].try_recv().is_err());
    }
}
